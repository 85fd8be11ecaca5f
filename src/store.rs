//! Local Store: durable keyed persistence for readings, media, queue tasks,
//! cached weather and app settings, backed by native_db.
//!
//! Every put/delete runs in its own read-write transaction, so a crash never
//! leaves a half-written record visible. Raw media bytes (videos) live as
//! files in a blob directory next to the database.

use native_db::{Builder, Database, Models, ToInput, ToKey};
use once_cell::sync::Lazy;
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::models::v1::{
    AppSettings, MediaItem, MediaItemKey, Reading, ReadingKey, SyncTask, SyncTaskKey,
    WeatherCacheEntry,
};
use crate::models::{TaskStatus, APP_SETTINGS_ID};

pub static MODELS: Lazy<Models> = Lazy::new(|| {
    let mut models = Models::new();
    models.define::<Reading>().expect("failed to define Reading model");
    models
        .define::<MediaItem>()
        .expect("failed to define MediaItem model");
    models
        .define::<SyncTask>()
        .expect("failed to define SyncTask model");
    models
        .define::<WeatherCacheEntry>()
        .expect("failed to define WeatherCacheEntry model");
    models
        .define::<AppSettings>()
        .expect("failed to define AppSettings model");
    models
});

pub struct LocalStore {
    database: Database<'static>,
    db_path: PathBuf,
    blob_dir: PathBuf,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("db_path", &self.db_path)
            .field("blob_dir", &self.blob_dir)
            .finish()
    }
}

impl LocalStore {
    /// Opens (or creates) the database file and the blob directory.
    pub fn open(db_path: impl AsRef<Path>, blob_dir: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let blob_dir = blob_dir.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::create_dir_all(&blob_dir)?;

        let database = Builder::new().create(&MODELS, &db_path)?;
        tracing::debug!("Opened local store at {}", db_path.display());

        Ok(Self {
            database,
            db_path,
            blob_dir,
        })
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn blob_dir(&self) -> &Path {
        &self.blob_dir
    }

    /// Flushes and releases the database handle.
    pub fn close(self) {
        tracing::debug!("Closing local store at {}", self.db_path.display());
        drop(self.database);
    }

    // ===== GENERIC CRUD =====

    /// Idempotent upsert keyed by the record's primary key. Overwrites the whole record.
    pub fn put<T: ToInput>(&self, item: T) -> Result<()> {
        let rw = self.database.rw_transaction()?;
        rw.upsert(item)?;
        rw.commit()?;
        Ok(())
    }

    /// Returns `None` when no record has this key.
    pub fn get<T: ToInput>(&self, id: impl ToKey) -> Result<Option<T>> {
        let r = self.database.r_transaction()?;
        Ok(r.get().primary(id)?)
    }

    /// Idempotent delete. Returns whether a record was removed.
    pub fn delete<T: ToInput>(&self, id: impl ToKey) -> Result<bool> {
        let rw = self.database.rw_transaction()?;
        let existing: Option<T> = rw.get().primary(id)?;
        let removed = match existing {
            Some(item) => {
                rw.remove(item)?;
                true
            }
            None => false,
        };
        rw.commit()?;
        Ok(removed)
    }

    pub fn all<T: ToInput>(&self) -> Result<Vec<T>> {
        let r = self.database.r_transaction()?;
        let items = r
            .scan()
            .primary::<T>()?
            .all()?
            .collect::<std::result::Result<Vec<T>, _>>()?;
        Ok(items)
    }

    // ===== READINGS =====

    pub fn get_reading(&self, id: &str) -> Result<Option<Reading>> {
        self.get(id.to_string())
    }

    pub fn readings_for_system(&self, system_id: &str) -> Result<Vec<Reading>> {
        let key = system_id.to_string();
        let r = self.database.r_transaction()?;
        let mut readings = r
            .scan()
            .secondary::<Reading>(ReadingKey::system_id)?
            .range(key.clone()..=key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sort_chronologically(&mut readings);
        Ok(readings)
    }

    pub fn readings_for_date(&self, date: &str) -> Result<Vec<Reading>> {
        let key = date.to_string();
        let r = self.database.r_transaction()?;
        let mut readings = r
            .scan()
            .secondary::<Reading>(ReadingKey::date)?
            .range(key.clone()..=key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sort_chronologically(&mut readings);
        Ok(readings)
    }

    /// The (system, date) pair is not enforced unique; the most recently updated record wins.
    pub fn reading_for_system_date(&self, system_id: &str, date: &str) -> Result<Option<Reading>> {
        let key = Reading::compose_system_date(system_id, date);
        let r = self.database.r_transaction()?;
        let readings = r
            .scan()
            .secondary::<Reading>(ReadingKey::system_date_key)?
            .range(key.clone()..=key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(readings.into_iter().max_by_key(|reading| reading.updated_at))
    }

    // ===== MEDIA =====

    pub fn get_media(&self, id: &str) -> Result<Option<MediaItem>> {
        self.get(id.to_string())
    }

    pub fn media_for_reading(&self, reading_id: &str) -> Result<Vec<MediaItem>> {
        let key = reading_id.to_string();
        let r = self.database.r_transaction()?;
        let mut media = r
            .scan()
            .secondary::<MediaItem>(MediaItemKey::reading_id)?
            .range(key.clone()..=key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        media.sort_by_key(|item| item.created_at);
        Ok(media)
    }

    /// Writes raw media bytes to the blob directory and returns the handle path.
    /// The write goes to a temporary name first so a partial file is never visible.
    pub fn write_blob(&self, name: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.blob_dir.join(name);
        let tmp = self.blob_dir.join(format!(".{}.partial", name));
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(path)
    }

    // ===== SYNC QUEUE =====

    pub fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<SyncTask>> {
        let key = status.as_str().to_string();
        let r = self.database.r_transaction()?;
        let tasks = r
            .scan()
            .secondary::<SyncTask>(SyncTaskKey::status_key)?
            .range(key.clone()..=key)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(tasks)
    }

    /// Pending tasks in arrival order.
    pub fn pending_tasks(&self) -> Result<Vec<SyncTask>> {
        let mut tasks = self.tasks_with_status(TaskStatus::Pending)?;
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    pub fn all_tasks(&self) -> Result<Vec<SyncTask>> {
        let mut tasks: Vec<SyncTask> = self.all()?;
        tasks.sort_by_key(|task| task.created_at);
        Ok(tasks)
    }

    /// Tasks still awaiting delivery (pending or mid-attempt).
    pub fn outstanding_task_count(&self) -> Result<usize> {
        Ok(self.tasks_with_status(TaskStatus::Pending)?.len()
            + self.tasks_with_status(TaskStatus::InProgress)?.len())
    }

    /// Removes every queue task in one transaction. Returns how many were removed.
    pub fn clear_tasks(&self) -> Result<usize> {
        let rw = self.database.rw_transaction()?;
        let tasks = rw
            .scan()
            .primary::<SyncTask>()?
            .all()?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let count = tasks.len();
        for task in tasks {
            rw.remove(task)?;
        }
        rw.commit()?;
        Ok(count)
    }

    /// Returns tasks stranded mid-attempt by a crash to pending. Retry counts are untouched.
    pub fn recover_interrupted_tasks(&self) -> Result<usize> {
        let stranded = self.tasks_with_status(TaskStatus::InProgress)?;
        let count = stranded.len();
        if count == 0 {
            return Ok(0);
        }
        let rw = self.database.rw_transaction()?;
        for mut task in stranded {
            task.status = TaskStatus::Pending;
            rw.upsert(task)?;
        }
        rw.commit()?;
        Ok(count)
    }

    // ===== WEATHER CACHE =====

    pub fn cached_weather(&self, date: &str) -> Result<Option<WeatherCacheEntry>> {
        self.get(date.to_string())
    }

    // ===== SETTINGS =====

    /// Stored settings, or the defaults when nothing was saved yet.
    pub fn load_settings(&self) -> Result<AppSettings> {
        Ok(self
            .get::<AppSettings>(APP_SETTINGS_ID.to_string())?
            .unwrap_or_default())
    }

    pub fn save_settings(&self, settings: AppSettings) -> Result<()> {
        self.put(AppSettings {
            id: APP_SETTINGS_ID.to_string(),
            ..settings
        })
    }
}

fn sort_chronologically(readings: &mut [Reading]) {
    readings.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then_with(|| a.time.cmp(&b.time))
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}
