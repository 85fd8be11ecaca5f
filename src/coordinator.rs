//! Reconciliation Coordinator: decides when the sync engine drains and turns
//! pass results into state the presentation layer can watch.
//!
//! Drains are triggered after a local save while online, on an
//! offline-to-online transition with work queued, and on explicit request.

use chrono::{Local, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{Error, Result};
use crate::media::{self, EncodedMedia, FrameGrabber, MediaError};
use crate::models::{
    AppSettings, MediaItem, MediaKind, Reading, SettingsPatch, SyncTask, Syncable, WeatherData,
};
use crate::store::LocalStore;
use crate::sync::{DrainOutcome, SyncEngine};
use crate::systems::{self, KillStreaks};

const NOTICE_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKind {
    Success,
    Error,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    RetrySync,
}

/// Toast-style outcome event
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub message: String,
    pub action: Option<NoticeAction>,
}

impl Notice {
    fn new(kind: NoticeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            action: None,
        }
    }
}

fn entries_phrase(count: usize) -> String {
    if count == 1 {
        "1 entry".to_string()
    } else {
        format!("{} entries", count)
    }
}

pub struct Coordinator {
    context: AppContext,
    settings: RwLock<AppSettings>,
    /// Every reading in the store, refreshed after a pass that synced something
    readings: RwLock<HashMap<String, Reading>>,
    pending_tx: watch::Sender<usize>,
    online_tx: watch::Sender<bool>,
    notices: broadcast::Sender<Notice>,
    frame_grabber: Option<Arc<dyn FrameGrabber>>,
}

impl Coordinator {
    pub fn new(context: AppContext, online: bool) -> Result<Self> {
        let readings = context
            .store
            .all::<Reading>()?
            .into_iter()
            .map(|reading| (reading.id.clone(), reading))
            .collect();
        let pending = context.engine.pending_count()?;
        let settings = context.settings.clone();

        let (pending_tx, _) = watch::channel(pending);
        let (online_tx, _) = watch::channel(online);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Ok(Self {
            context,
            settings: RwLock::new(settings),
            readings: RwLock::new(readings),
            pending_tx,
            online_tx,
            notices,
            frame_grabber: None,
        })
    }

    /// Enables still-frame previews for attached videos.
    pub fn with_frame_grabber(mut self, grabber: Arc<dyn FrameGrabber>) -> Self {
        self.frame_grabber = Some(grabber);
        self
    }

    pub fn shutdown(self) -> Result<()> {
        self.context.shutdown()
    }

    fn store(&self) -> &LocalStore {
        &self.context.store
    }

    fn engine(&self) -> &SyncEngine {
        &self.context.engine
    }

    // ===== REACTIVE STATE =====

    pub fn pending_count(&self) -> usize {
        *self.pending_tx.borrow()
    }

    pub fn is_online(&self) -> bool {
        *self.online_tx.borrow()
    }

    pub fn is_syncing(&self) -> bool {
        self.engine().is_draining()
    }

    pub fn subscribe_pending(&self) -> watch::Receiver<usize> {
        self.pending_tx.subscribe()
    }

    pub fn subscribe_online(&self) -> watch::Receiver<bool> {
        self.online_tx.subscribe()
    }

    pub fn subscribe_syncing(&self) -> watch::Receiver<bool> {
        self.engine().subscribe_draining()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn notify(&self, notice: Notice) {
        tracing::debug!("{:?}: {}", notice.kind, notice.message);
        // no subscribers is fine
        let _ = self.notices.send(notice);
    }

    fn refresh_pending(&self) {
        match self.engine().pending_count() {
            Ok(count) => {
                self.pending_tx.send_replace(count);
            }
            Err(e) => tracing::error!("Could not count pending sync tasks: {}", e),
        }
    }

    /// Feeds the platform connectivity signal. Coming back online with work
    /// queued starts a pass, whose outcome is returned.
    pub async fn set_online(&self, online: bool) -> Option<DrainOutcome> {
        let was_online = self.online_tx.send_replace(online);
        if online == was_online {
            return None;
        }
        tracing::info!("Connectivity changed: {}", if online { "online" } else { "offline" });

        if !online {
            return None;
        }
        self.refresh_pending();
        let pending = self.pending_count();
        if pending == 0 {
            return None;
        }
        self.notify(Notice::new(
            NoticeKind::Info,
            format!("Back online, syncing {} pending items", pending),
        ));
        Some(self.sync_now().await)
    }

    // ===== READINGS =====

    /// Persists a reading and queues it for delivery, then syncs if online.
    /// Sync failures are reported through notices, never through this result.
    pub async fn save(&self, mut reading: Reading) -> Result<Reading> {
        if reading.system_id.trim().is_empty() {
            return Err(Error::Validation("reading has no system id".to_string()));
        }
        if reading.date.trim().is_empty() {
            return Err(Error::Validation("reading has no date".to_string()));
        }

        reading.recompute_derived();
        reading.set_synced(false);
        reading.updated_at = Utc::now();

        self.store().put(reading.clone())?;
        self.engine().enqueue_reading(&reading.id)?;
        self.cache_reading(reading.clone());
        self.refresh_pending();

        if self.is_online() {
            self.sync_now().await;
        }
        Ok(reading)
    }

    fn cache_reading(&self, reading: Reading) {
        let mut readings = self
            .readings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        readings.insert(reading.id.clone(), reading);
    }

    fn refresh_cache(&self) -> Result<()> {
        let fresh: HashMap<String, Reading> = self
            .store()
            .all::<Reading>()?
            .into_iter()
            .map(|reading| (reading.id.clone(), reading))
            .collect();
        *self
            .readings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = fresh;
        Ok(())
    }

    /// Cached readings, oldest first.
    pub fn entries(&self) -> Vec<Reading> {
        let readings = self
            .readings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut entries: Vec<Reading> = readings.values().cloned().collect();
        entries.sort_by(|a, b| (&a.date, &a.time).cmp(&(&b.date, &b.time)));
        entries
    }

    pub fn get_for(&self, system_id: &str, date: &str) -> Result<Option<Reading>> {
        self.store().reading_for_system_date(system_id, date)
    }

    pub fn get_all_for_system(&self, system_id: &str) -> Result<Vec<Reading>> {
        self.store().readings_for_system(system_id)
    }

    pub fn get_all_for_date(&self, date: &str) -> Result<Vec<Reading>> {
        self.store().readings_for_date(date)
    }

    /// Unsaved reading for today, with the system's probe labels. Unknown
    /// systems get no probes.
    pub fn create_blank(&self, system_id: &str) -> Reading {
        let labels: &[&str] = systems::system_by_id(system_id)
            .map(|system| system.probe_labels())
            .unwrap_or(&[]);
        let now = Local::now();
        Reading::new(
            Uuid::new_v4().to_string(),
            system_id.to_string(),
            now.format("%Y-%m-%d").to_string(),
            now.format("%H:%M").to_string(),
            labels,
        )
    }

    /// Forecast for the configured site, cached per date.
    pub async fn weather_for(&self, date: &str) -> Option<WeatherData> {
        let settings = self.settings();
        self.context
            .weather
            .lookup(date, settings.farm_latitude, settings.farm_longitude)
            .await
    }

    /// Fills empty weather fields from the forecast. Returns false when no forecast is available.
    pub async fn suggest_weather(&self, reading: &mut Reading) -> bool {
        match self.weather_for(&reading.date).await {
            Some(data) => {
                reading.apply_weather_suggestion(&data);
                true
            }
            None => false,
        }
    }

    /// Current and longest kill-cycle streaks, one peak per recorded day.
    pub fn kill_streaks_for(&self, system_id: &str) -> Result<KillStreaks> {
        let mut daily: Vec<(String, Option<f64>)> = Vec::new();
        for reading in self.store().readings_for_system(system_id)? {
            match daily.last_mut() {
                Some((date, peak)) if *date == reading.date => *peak = reading.peak_temp,
                _ => daily.push((reading.date.clone(), reading.peak_temp)),
            }
        }
        let peaks: Vec<Option<f64>> = daily.into_iter().map(|(_, peak)| peak).collect();
        Ok(systems::kill_streaks(&peaks))
    }

    // ===== MEDIA =====

    pub async fn attach_photo(
        &self,
        reading_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<MediaItem> {
        let reading = self.load_reading(reading_id)?;
        let encoded = media::encode_photo(bytes, mime_type)?;
        self.attach(reading, Uuid::new_v4().to_string(), encoded).await
    }

    /// Stores the clip in the blob directory and attaches it.
    pub async fn attach_video(
        &self,
        reading_id: &str,
        bytes: &[u8],
        mime_type: &str,
    ) -> Result<MediaItem> {
        if bytes.is_empty() {
            return Err(MediaError::Empty.into());
        }
        let reading = self.load_reading(reading_id)?;
        let media_id = Uuid::new_v4().to_string();
        let blob_path = self.store().write_blob(
            &format!("{}.{}", media_id, MediaKind::Video.extension()),
            bytes,
        )?;
        let encoded = media::encode_video(blob_path, mime_type, self.frame_grabber.as_deref());
        self.attach(reading, media_id, encoded).await
    }

    fn load_reading(&self, reading_id: &str) -> Result<Reading> {
        self.store()
            .get_reading(reading_id)?
            .ok_or_else(|| Error::NotFound(format!("reading {}", reading_id)))
    }

    async fn attach(
        &self,
        mut reading: Reading,
        media_id: String,
        encoded: EncodedMedia,
    ) -> Result<MediaItem> {
        let now = Utc::now();
        let item = MediaItem {
            id: media_id,
            reading_id: reading.id.clone(),
            kind: encoded.kind,
            mime_type: encoded.mime_type,
            payload: encoded.payload,
            thumbnail: encoded.thumbnail,
            remote: None,
            filename: media::media_filename(&reading.date, &reading.system_id, encoded.kind, now),
            synced: false,
            created_at: now,
        };

        self.store().put(item.clone())?;
        self.engine().enqueue_media(&item.id)?;
        tracing::info!("Attached {} {} to reading {}", item.kind.as_str(), item.id, reading.id);

        reading.media_ids.push(item.id.clone());
        self.save(reading).await?;
        Ok(item)
    }

    pub fn media_for(&self, reading_id: &str) -> Result<Vec<MediaItem>> {
        self.store().media_for_reading(reading_id)
    }

    // ===== SYNC =====

    /// Runs a pass now. A pass already in flight makes this a silent no-op.
    pub async fn sync_now(&self) -> DrainOutcome {
        let outcome = self.engine().drain().await;
        let DrainOutcome::Completed(report) = &outcome else {
            return outcome;
        };

        self.refresh_pending();

        if report.synced > 0 {
            if let Err(e) = self.refresh_cache() {
                tracing::error!("Could not refresh readings after sync: {}", e);
            }
            if let Err(e) = self.record_sync_time() {
                tracing::error!("Could not record last sync time: {}", e);
            }
            self.notify(Notice::new(
                NoticeKind::Success,
                format!("Synced {}", entries_phrase(report.synced)),
            ));
        }
        if report.failed > 0 {
            self.notify(Notice {
                kind: NoticeKind::Error,
                message: format!("{} failed to sync", entries_phrase(report.failed)),
                action: Some(NoticeAction::RetrySync),
            });
        }

        outcome
    }

    fn record_sync_time(&self) -> Result<()> {
        self.update_config(SettingsPatch {
            last_sync_time: Some(Utc::now()),
            ..Default::default()
        })?;
        Ok(())
    }

    /// Every queued task, parked ones included, oldest first.
    pub fn tasks(&self) -> Result<Vec<SyncTask>> {
        self.store().all_tasks()
    }

    /// Deletes every queued sync task. This cannot be undone: readings and
    /// media stay on the device but are never sent unless saved again.
    pub fn discard_pending(&self) -> Result<usize> {
        let removed = self.engine().discard_all()?;
        self.refresh_pending();
        self.notify(Notice::new(NoticeKind::Success, "Pending items cleared"));
        Ok(removed)
    }

    // ===== CONFIGURATION =====

    pub fn settings(&self) -> AppSettings {
        self.settings
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Merges a partial update into the app configuration and persists it.
    pub fn update_config(&self, patch: SettingsPatch) -> Result<AppSettings> {
        let mut settings = self
            .settings
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let merged = settings.merge(patch);
        self.store().save_settings(merged.clone())?;
        *settings = merged.clone();
        Ok(merged)
    }
}
