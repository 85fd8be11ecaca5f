//! Remote Gateway contract: the two write operations the sync engine needs
//! from the remote system of record (spreadsheet row append and file upload).

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::Reading;
use crate::systems;

pub use http::{HttpGateway, HttpGatewayConfig};

/// Upload size ceiling enforced in front of the file store (4 MiB)
pub const DEFAULT_MEDIA_MAX_BYTES: usize = 4 * 1024 * 1024;

// ===== ERRORS =====

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Remote target identifiers are missing
    #[error("gateway not configured: {0}")]
    Configuration(String),

    /// The request was rejected as malformed
    #[error("request rejected: {0}")]
    Validation(String),

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("gateway call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected response: {0}")]
    InvalidResponse(String),
}

/// How the sync engine should treat a failed call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCategory {
    /// Count the failure but keep the retry budget; the operator must fix configuration
    Configuration,
    /// Retrying the same request can never succeed
    Permanent,
    /// Retrying may succeed
    Transient,
    TooLarge,
}

impl RemoteError {
    pub fn category(&self) -> FailureCategory {
        match self {
            RemoteError::Configuration(_) => FailureCategory::Configuration,
            RemoteError::Validation(_) => FailureCategory::Permanent,
            RemoteError::PayloadTooLarge { .. } => FailureCategory::TooLarge,
            RemoteError::Transport(_)
            | RemoteError::Status { .. }
            | RemoteError::Timeout(_)
            | RemoteError::InvalidResponse(_) => FailureCategory::Transient,
        }
    }
}

// ===== REQUEST / RESPONSE TYPES =====

/// One spreadsheet row for a reading. Average and peak are not sent; the
/// remote sheet computes them with formulas in their own columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub date: String,
    pub time: String,
    pub weather: Option<String>,
    pub ambient_min: Option<f64>,
    pub ambient_max: Option<f64>,
    pub moisture: Option<String>,
    pub odour: Option<String>,
    pub probes: Vec<Option<f64>>,
    pub vent_temps: String,
    pub visual_notes: String,
    pub general_notes: String,
    pub media_links: Vec<String>,
}

impl SheetRow {
    /// Builds the row for a reading, padding or truncating probes to the system's probe count.
    pub fn from_reading(reading: &Reading, media_links: Vec<String>) -> Self {
        let probe_count = systems::probe_count_for(&reading.system_id);
        let mut probes = reading.probe_values();
        probes.resize(probe_count, None);

        Self {
            date: reading.date.clone(),
            time: reading.time.clone(),
            weather: reading.weather.map(|w| w.as_str().to_string()),
            ambient_min: reading.ambient_min,
            ambient_max: reading.ambient_max,
            moisture: reading.moisture.map(|m| m.as_str().to_string()),
            odour: reading.odour.map(|o| o.as_str().to_string()),
            probes,
            vent_temps: reading.vent_temps.clone(),
            visual_notes: reading.visual_notes.clone(),
            general_notes: reading.general_notes.clone(),
            media_links,
        }
    }

    /// Cells in sheet column order: date, time, weather, ambient min/max, moisture, odour,
    /// probes, average and peak placeholders, vent temps, visual notes, general notes, links.
    pub fn cells(&self) -> Vec<String> {
        let optional_number = |v: Option<f64>| v.map(|n| n.to_string()).unwrap_or_default();

        let mut cells = vec![
            self.date.clone(),
            self.time.clone(),
            self.weather.clone().unwrap_or_default(),
            optional_number(self.ambient_min),
            optional_number(self.ambient_max),
            self.moisture.clone().unwrap_or_default(),
            self.odour.clone().unwrap_or_default(),
        ];
        cells.extend(self.probes.iter().map(|p| optional_number(*p)));
        // average, peak
        cells.push(String::new());
        cells.push(String::new());
        cells.push(self.vent_temps.clone());
        cells.push(self.visual_notes.clone());
        cells.push(self.general_notes.clone());
        cells.push(self.media_links.join("\n"));
        cells
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct AppendReceipt {
    /// Range reference of the appended row, e.g. `'Pivot #1'!A5:V5`
    pub updated_range: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaUpload {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UploadedMedia {
    pub remote_id: String,
    pub view_url: String,
}

// ===== GATEWAY TRAIT =====

#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Appends one row for a monitored system. `system_id` is the registry id
    /// (`pivot-1`, `batch-1`); the remote side resolves it to the sheet tab.
    async fn append_reading_row(
        &self,
        system_id: &str,
        row: &SheetRow,
    ) -> Result<AppendReceipt, RemoteError>;

    /// Stores a media file. Must be followed by [`RemoteGateway::make_public`].
    async fn upload_media(&self, upload: &MediaUpload) -> Result<UploadedMedia, RemoteError>;

    /// Makes an uploaded file readable through its view URL.
    async fn make_public(&self, remote_id: &str) -> Result<(), RemoteError>;
}
