use chrono::{DateTime, Utc};
use native_db::{native_db, ToKey};
use native_model::{native_model, Model};
use serde::{Deserialize, Serialize};

// ===== TRAITS =====

/// A locally captured record that the remote system may or may not hold yet.
pub trait Syncable {
    fn is_synced(&self) -> bool;
    fn set_synced(&mut self, synced: bool);
}

// ===== ENUMS =====

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeatherCondition {
    Sunny,
    Cloudy,
    Overcast,
    Rain,
    Wind,
    Frost,
    Fog,
    Storm,
}

impl WeatherCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            WeatherCondition::Sunny => "Sunny",
            WeatherCondition::Cloudy => "Cloudy",
            WeatherCondition::Overcast => "Overcast",
            WeatherCondition::Rain => "Rain",
            WeatherCondition::Wind => "Wind",
            WeatherCondition::Frost => "Frost",
            WeatherCondition::Fog => "Fog",
            WeatherCondition::Storm => "Storm",
        }
    }

    /// Maps a WMO weather interpretation code. Unknown codes read as cloudy.
    pub fn from_wmo_code(code: i32) -> Self {
        match code {
            0 | 1 => WeatherCondition::Sunny,
            2 => WeatherCondition::Cloudy,
            3 => WeatherCondition::Overcast,
            45 | 48 => WeatherCondition::Fog,
            51 | 53 | 55 | 56 | 57 | 61 | 63 | 65 | 66 | 67 | 80 | 81 | 82 => {
                WeatherCondition::Rain
            }
            71 | 73 | 75 | 77 | 85 | 86 => WeatherCondition::Frost,
            95 | 96 | 99 => WeatherCondition::Storm,
            _ => WeatherCondition::Cloudy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MoistureLevel {
    Dry,
    Good,
    Wet,
}

impl MoistureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoistureLevel::Dry => "Dry",
            MoistureLevel::Good => "Good",
            MoistureLevel::Wet => "Wet",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OdourLevel {
    None,
    Mild,
    Strong,
}

impl OdourLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OdourLevel::None => "None",
            OdourLevel::Mild => "Mild",
            OdourLevel::Strong => "Strong",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryMode {
    Stepper,
    Grid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Photo,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Photo => "photo",
            MediaKind::Video => "video",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Video => "mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    FailedPermanently,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::FailedPermanently => "failed_permanently",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    // Declaration order is delivery order within a pass.
    Media,
    Entry,
}

// ===== EMBEDDED TYPES =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeReading {
    pub index: usize,
    pub label: String,
    pub value: Option<f64>,
}

/// Stored bytes of a media item. Photos live inline, videos as a file in the blob directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MediaPayload {
    Inline { data_uri: String },
    Blob { path: String },
}

/// Where an uploaded media item lives on the remote side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRef {
    pub file_id: String,
    pub view_url: String,
}

/// What a queue task delivers. Entry tasks point at a Reading, media tasks at a MediaItem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncTarget {
    Entry { reading_id: String },
    Media { media_id: String },
}

impl SyncTarget {
    pub fn kind(&self) -> TaskKind {
        match self {
            SyncTarget::Entry { .. } => TaskKind::Entry,
            SyncTarget::Media { .. } => TaskKind::Media,
        }
    }

    pub fn record_id(&self) -> &str {
        match self {
            SyncTarget::Entry { reading_id } => reading_id,
            SyncTarget::Media { media_id } => media_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherData {
    pub condition: WeatherCondition,
    pub weather_code: i32,
    pub current_temp: f64,
    pub min_temp: f64,
    pub max_temp: f64,
}

// ===== READING =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 1, version = 1)]
#[native_db(secondary_key(system_date_key -> String))]
pub struct Reading {
    #[primary_key]
    pub id: String,
    #[secondary_key]
    pub system_id: String,
    /// YYYY-MM-DD
    #[secondary_key]
    pub date: String,
    /// HH:MM local time
    pub time: String,
    pub weather: Option<WeatherCondition>,
    pub weather_auto: bool,
    pub ambient_min: Option<f64>,
    pub ambient_max: Option<f64>,
    pub ambient_min_auto: bool,
    pub ambient_max_auto: bool,
    pub moisture: Option<MoistureLevel>,
    pub odour: Option<OdourLevel>,
    pub probes: Vec<ProbeReading>,
    pub average_temp: Option<f64>,
    pub peak_temp: Option<f64>,
    pub vent_temps: String,
    pub visual_notes: String,
    pub general_notes: String,
    pub media_ids: Vec<String>,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reading {
    /// Blank reading for one system on one day, one empty probe per label.
    pub fn new(
        id: String,
        system_id: String,
        date: String,
        time: String,
        probe_labels: &[&str],
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            system_id,
            date,
            time,
            weather: None,
            weather_auto: false,
            ambient_min: None,
            ambient_max: None,
            ambient_min_auto: false,
            ambient_max_auto: false,
            moisture: None,
            odour: None,
            probes: probe_labels
                .iter()
                .enumerate()
                .map(|(index, label)| ProbeReading {
                    index,
                    label: label.to_string(),
                    value: None,
                })
                .collect(),
            average_temp: None,
            peak_temp: None,
            vent_temps: String::new(),
            visual_notes: String::new(),
            general_notes: String::new(),
            media_ids: Vec::new(),
            synced: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Composite (system, date) lookup key
    pub fn system_date_key(&self) -> String {
        Self::compose_system_date(&self.system_id, &self.date)
    }

    pub fn compose_system_date(system_id: &str, date: &str) -> String {
        format!("{}|{}", system_id, date)
    }

    /// Sets one probe value and refreshes average and peak.
    /// Returns false when the index is out of range.
    pub fn set_probe(&mut self, index: usize, value: Option<f64>) -> bool {
        match self.probes.iter_mut().find(|p| p.index == index) {
            Some(probe) => {
                probe.value = value;
                self.recompute_derived();
                true
            }
            None => false,
        }
    }

    pub fn recompute_derived(&mut self) {
        let (average, peak) = probe_stats(&self.probes);
        self.average_temp = average;
        self.peak_temp = peak;
    }

    pub fn set_weather(&mut self, weather: Option<WeatherCondition>) {
        self.weather = weather;
        self.weather_auto = false;
    }

    pub fn set_ambient_min(&mut self, value: Option<f64>) {
        self.ambient_min = value;
        self.ambient_min_auto = false;
    }

    pub fn set_ambient_max(&mut self, value: Option<f64>) {
        self.ambient_max = value;
        self.ambient_max_auto = false;
    }

    /// Fills empty environmental fields from a forecast and flags them as suggested.
    /// Fields the user already filled are left alone.
    pub fn apply_weather_suggestion(&mut self, data: &WeatherData) {
        if self.weather.is_none() {
            self.weather = Some(data.condition);
            self.weather_auto = true;
        }
        if self.ambient_min.is_none() {
            self.ambient_min = Some(data.min_temp);
            self.ambient_min_auto = true;
        }
        if self.ambient_max.is_none() {
            self.ambient_max = Some(data.max_temp);
            self.ambient_max_auto = true;
        }
    }

    pub fn probe_values(&self) -> Vec<Option<f64>> {
        self.probes.iter().map(|p| p.value).collect()
    }
}

/// Rounded mean and maximum over the probes that hold a value; both None when none do.
pub fn probe_stats(probes: &[ProbeReading]) -> (Option<f64>, Option<f64>) {
    let values: Vec<f64> = probes.iter().filter_map(|p| p.value).collect();
    if values.is_empty() {
        return (None, None);
    }
    let sum: f64 = values.iter().sum();
    let average = (sum / values.len() as f64).round();
    let peak = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    (Some(average), Some(peak))
}

impl Syncable for Reading {
    fn is_synced(&self) -> bool {
        self.synced
    }

    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
}

// ===== MEDIA =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 2, version = 1)]
#[native_db]
pub struct MediaItem {
    #[primary_key]
    pub id: String,
    #[secondary_key]
    pub reading_id: String,
    pub kind: MediaKind,
    pub mime_type: String,
    pub payload: MediaPayload,
    /// JPEG data URI, absent when preview generation failed
    pub thumbnail: Option<String>,
    pub remote: Option<RemoteRef>,
    pub filename: String,
    pub synced: bool,
    pub created_at: DateTime<Utc>,
}

impl MediaItem {
    pub fn remote_url(&self) -> Option<&str> {
        self.remote.as_ref().map(|r| r.view_url.as_str())
    }
}

impl Syncable for MediaItem {
    fn is_synced(&self) -> bool {
        self.synced
    }

    fn set_synced(&mut self, synced: bool) {
        self.synced = synced;
    }
}

// ===== SYNC QUEUE =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 3, version = 1)]
#[native_db(secondary_key(status_key -> String))]
pub struct SyncTask {
    #[primary_key]
    pub id: String,
    pub target: SyncTarget,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Detail of the most recent failed attempt
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl SyncTask {
    pub fn new(id: String, target: SyncTarget) -> Self {
        Self {
            id,
            target,
            status: TaskStatus::Pending,
            retry_count: 0,
            last_attempt: None,
            last_error: None,
            created_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> TaskKind {
        self.target.kind()
    }

    pub fn status_key(&self) -> String {
        self.status.as_str().to_string()
    }
}

// ===== WEATHER CACHE =====

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 4, version = 1)]
#[native_db]
pub struct WeatherCacheEntry {
    /// YYYY-MM-DD
    #[primary_key]
    pub date: String,
    pub data: WeatherData,
    pub fetched_at: DateTime<Utc>,
}

// ===== APP SETTINGS =====

pub const APP_SETTINGS_ID: &str = "app-settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[native_model(id = 5, version = 1)]
#[native_db]
pub struct AppSettings {
    #[primary_key]
    pub id: String,
    pub entry_mode: EntryMode,
    pub active_systems: Vec<String>,
    pub farm_latitude: f64,
    pub farm_longitude: f64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            id: APP_SETTINGS_ID.to_string(),
            entry_mode: EntryMode::Stepper,
            active_systems: crate::systems::COMPOST_SYSTEMS
                .iter()
                .map(|s| s.id.to_string())
                .collect(),
            farm_latitude: -39.06,
            farm_longitude: 174.08,
            last_sync_time: None,
        }
    }
}

/// Partial update for [`AppSettings`]; `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsPatch {
    pub entry_mode: Option<EntryMode>,
    pub active_systems: Option<Vec<String>>,
    pub farm_latitude: Option<f64>,
    pub farm_longitude: Option<f64>,
    pub last_sync_time: Option<DateTime<Utc>>,
}

impl AppSettings {
    pub fn merge(&self, patch: SettingsPatch) -> Self {
        Self {
            id: APP_SETTINGS_ID.to_string(),
            entry_mode: patch.entry_mode.unwrap_or(self.entry_mode),
            active_systems: patch
                .active_systems
                .unwrap_or_else(|| self.active_systems.clone()),
            farm_latitude: patch.farm_latitude.unwrap_or(self.farm_latitude),
            farm_longitude: patch.farm_longitude.unwrap_or(self.farm_longitude),
            last_sync_time: patch.last_sync_time.or(self.last_sync_time),
        }
    }
}
