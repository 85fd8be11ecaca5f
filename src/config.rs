use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::gateway::{HttpGatewayConfig, DEFAULT_MEDIA_MAX_BYTES};
use crate::sync::{SyncPolicy, DEFAULT_GATEWAY_TIMEOUT, DEFAULT_MAX_RETRIES};
use crate::weather::{DEFAULT_TTL_HOURS, DEFAULT_WEATHER_URL};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub db_path: PathBuf,
    pub blob_dir: PathBuf,
    pub api_base_url: String,
    pub sheets_write_path: String,
    pub media_upload_path: String,
    pub media_public_path: Option<String>,
    pub media_max_bytes: usize,
    pub weather_url: String,
    pub weather_ttl_hours: i64,
    pub max_retries: u32,
    /// Seconds; 0 disables the per-call timeout
    pub gateway_timeout_secs: u64,
    pub fail_fast_too_large: bool,
}

impl Config {
    /// Creates a config from environment variables, loading `.env` first
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates a config from any key lookup. Only `COMPOST_API_BASE_URL` is required.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let api_base_url = get("COMPOST_API_BASE_URL").ok_or_else(|| {
            Error::Config("COMPOST_API_BASE_URL environment variable is required".to_string())
        })?;

        let db_path = PathBuf::from(get("COMPOST_DB_PATH").unwrap_or_else(|| "compost.db".to_string()));
        let blob_dir = match get("COMPOST_BLOB_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => db_path
                .parent()
                .map(|parent| parent.join("blobs"))
                .unwrap_or_else(|| PathBuf::from("blobs")),
        };

        Ok(Self {
            db_path,
            blob_dir,
            api_base_url,
            sheets_write_path: get("COMPOST_SHEETS_WRITE_PATH")
                .unwrap_or_else(|| "compost-sheets-write".to_string()),
            media_upload_path: get("COMPOST_MEDIA_UPLOAD_PATH")
                .unwrap_or_else(|| "compost-media-upload".to_string()),
            media_public_path: get("COMPOST_MEDIA_PUBLIC_PATH"),
            media_max_bytes: parse_or(&get, "COMPOST_MEDIA_MAX_BYTES", DEFAULT_MEDIA_MAX_BYTES)?,
            weather_url: get("COMPOST_WEATHER_URL")
                .unwrap_or_else(|| DEFAULT_WEATHER_URL.to_string()),
            weather_ttl_hours: parse_or(&get, "COMPOST_WEATHER_TTL_HOURS", DEFAULT_TTL_HOURS)?,
            max_retries: parse_or(&get, "COMPOST_SYNC_MAX_RETRIES", DEFAULT_MAX_RETRIES)?,
            gateway_timeout_secs: parse_or(
                &get,
                "COMPOST_GATEWAY_TIMEOUT_SECS",
                DEFAULT_GATEWAY_TIMEOUT.as_secs(),
            )?,
            fail_fast_too_large: parse_or(&get, "COMPOST_FAIL_FAST_TOO_LARGE", true)?,
        })
    }

    pub fn gateway_config(&self) -> HttpGatewayConfig {
        HttpGatewayConfig {
            base_url: self.api_base_url.clone(),
            sheets_write_path: self.sheets_write_path.clone(),
            media_upload_path: self.media_upload_path.clone(),
            media_public_path: self.media_public_path.clone(),
            max_media_bytes: self.media_max_bytes,
        }
    }

    pub fn sync_policy(&self) -> SyncPolicy {
        SyncPolicy {
            max_retries: self.max_retries,
            fail_fast_too_large: self.fail_fast_too_large,
            gateway_timeout: match self.gateway_timeout_secs {
                0 => None,
                secs => Some(Duration::from_secs(secs)),
            },
        }
    }

    pub fn weather_ttl(&self) -> ChronoDuration {
        ChronoDuration::hours(self.weather_ttl_hours)
    }
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{} has an invalid value {:?}: {}", key, raw, e))),
        None => Ok(default),
    }
}
