pub mod v1;

// ===== VERSIONED MODELS FOLLOWING NATIVE_DB PATTERN =====
// A model that changes shape gets a new module (v2, ...) with a bumped
// native_model version and a From impl from the previous one; the aliases
// below always point at the latest version.

pub mod data {
    pub type Reading = super::v1::Reading;
    pub type MediaItem = super::v1::MediaItem;
    pub type SyncTask = super::v1::SyncTask;
    pub type WeatherCacheEntry = super::v1::WeatherCacheEntry;
    pub type AppSettings = super::v1::AppSettings;

    pub use super::v1;
}

pub use data::*;

// Shared enums and embedded types
pub use v1::{
    probe_stats, EntryMode, MediaKind, MediaPayload, MoistureLevel, OdourLevel, ProbeReading,
    RemoteRef, SettingsPatch, SyncTarget, Syncable, TaskKind, TaskStatus, WeatherCondition,
    WeatherData, APP_SETTINGS_ID,
};
