//! Sync Queue Engine: turns "this record must reach the remote system" into
//! durable queue tasks and drains them against the Remote Gateway.
//!
//! A drain pass reads every pending task, orders media uploads ahead of entry
//! rows (stable, so arrival order survives within a kind) and delivers them one
//! at a time. Failures are recorded on the task and counted in the report;
//! nothing raised during delivery escapes [`SyncEngine::drain`].

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::gateway::{FailureCategory, MediaUpload, RemoteError, RemoteGateway, SheetRow};
use crate::media::{self, MediaError};
use crate::models::{RemoteRef, SyncTarget, SyncTask, Syncable, TaskStatus};
use crate::store::LocalStore;
use crate::systems;

pub const DEFAULT_MAX_RETRIES: u32 = 5;
pub const DEFAULT_GATEWAY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct SyncPolicy {
    /// Failed attempts after which a task is parked as failed-permanently
    pub max_retries: u32,
    /// Park oversized uploads immediately instead of retrying them
    pub fail_fast_too_large: bool,
    /// Upper bound on each gateway call; `None` waits indefinitely
    pub gateway_timeout: Option<Duration>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            fail_fast_too_large: true,
            gateway_timeout: Some(DEFAULT_GATEWAY_TIMEOUT),
        }
    }
}

/// One task that did not make it in this pass.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskFailure {
    pub task_id: String,
    pub target: SyncTarget,
    pub reason: String,
    /// The task was parked and will not be attempted again
    pub permanent: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    pub synced: usize,
    pub failed: usize,
    pub failures: Vec<TaskFailure>,
}

impl DrainReport {
    fn record_failure(&mut self, task: &SyncTask, reason: String, permanent: bool) {
        self.failed += 1;
        self.failures.push(TaskFailure {
            task_id: task.id.clone(),
            target: task.target.clone(),
            reason,
            permanent,
        });
    }
}

/// Result of asking for a drain. `Skipped` means another pass was already running.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    Skipped,
}

impl DrainOutcome {
    pub fn report(&self) -> Option<&DrainReport> {
        match self {
            DrainOutcome::Completed(report) => Some(report),
            DrainOutcome::Skipped => None,
        }
    }
}

/// What happened to a task's target during one attempt
enum Delivery {
    Delivered,
    /// The target record is gone; the task resolves without counting
    TargetGone,
}

#[derive(thiserror::Error, Debug)]
enum AttemptError {
    #[error("{0}")]
    Local(#[from] Error),

    #[error("{0}")]
    Remote(#[from] RemoteError),

    #[error("media item {0} not found")]
    MissingMedia(String),

    #[error("media payload unreadable: {0}")]
    Payload(#[from] MediaError),
}

impl AttemptError {
    fn category(&self) -> FailureCategory {
        match self {
            AttemptError::Remote(e) => e.category(),
            _ => FailureCategory::Transient,
        }
    }
}

pub struct SyncEngine {
    store: Arc<LocalStore>,
    gateway: Arc<dyn RemoteGateway>,
    policy: SyncPolicy,
    draining: AtomicBool,
    draining_tx: watch::Sender<bool>,
    last_enqueued: Mutex<DateTime<Utc>>,
}

/// Clears the draining state when a pass ends, however it ends.
struct DrainGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.engine.draining.store(false, Ordering::Release);
        self.engine.draining_tx.send_replace(false);
    }
}

impl SyncEngine {
    pub fn new(store: Arc<LocalStore>, gateway: Arc<dyn RemoteGateway>, policy: SyncPolicy) -> Self {
        let (draining_tx, _) = watch::channel(false);
        Self {
            store,
            gateway,
            policy,
            draining: AtomicBool::new(false),
            draining_tx,
            last_enqueued: Mutex::new(DateTime::<Utc>::MIN_UTC),
        }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Watch channel that flips while a pass is running.
    pub fn subscribe_draining(&self) -> watch::Receiver<bool> {
        self.draining_tx.subscribe()
    }

    // ===== QUEUE =====

    /// Persists a new pending task for the target.
    pub fn enqueue(&self, target: SyncTarget) -> Result<SyncTask> {
        let mut task = SyncTask::new(Uuid::new_v4().to_string(), target);
        task.created_at = self.next_enqueue_time(task.created_at);
        self.store.put(task.clone())?;
        tracing::debug!(
            "Enqueued {:?} task {} for {}",
            task.kind(),
            task.id,
            task.target.record_id()
        );
        Ok(task)
    }

    pub fn enqueue_reading(&self, reading_id: &str) -> Result<SyncTask> {
        self.enqueue(SyncTarget::Entry {
            reading_id: reading_id.to_string(),
        })
    }

    pub fn enqueue_media(&self, media_id: &str) -> Result<SyncTask> {
        self.enqueue(SyncTarget::Media {
            media_id: media_id.to_string(),
        })
    }

    /// Tasks still awaiting delivery. Parked tasks are not counted.
    pub fn pending_count(&self) -> Result<usize> {
        self.store.outstanding_task_count()
    }

    /// Deletes every queue task, parked ones included. Irreversible: the
    /// local records stay but nothing is ever sent for them unless they are
    /// saved again.
    pub fn discard_all(&self) -> Result<usize> {
        let removed = self.store.clear_tasks()?;
        tracing::warn!("Discarded {} sync tasks", removed);
        Ok(removed)
    }

    // Arrival order must survive a created_at tie, so timestamps are kept strictly increasing.
    fn next_enqueue_time(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let mut last = self
            .last_enqueued
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = if now > *last {
            now
        } else {
            *last + ChronoDuration::microseconds(1)
        };
        *last = next;
        next
    }

    // ===== DRAIN =====

    /// Runs one pass over every pending task. Returns [`DrainOutcome::Skipped`]
    /// straight away when a pass is already running.
    pub async fn drain(&self) -> DrainOutcome {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("Sync pass already running, skipping");
            return DrainOutcome::Skipped;
        }
        self.draining_tx.send_replace(true);
        let _guard = DrainGuard { engine: self };

        let mut report = DrainReport::default();
        let mut tasks = match self.store.pending_tasks() {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!("Could not read the sync queue: {}", e);
                return DrainOutcome::Completed(report);
            }
        };
        if tasks.is_empty() {
            return DrainOutcome::Completed(report);
        }

        // stable: media before entries, arrival order within a kind
        tasks.sort_by_key(|task| task.kind());
        tracing::info!("Sync pass started with {} pending tasks", tasks.len());

        for task in tasks {
            self.process_task(task, &mut report).await;
        }

        tracing::info!(
            "Sync pass finished: {} synced, {} failed",
            report.synced,
            report.failed
        );
        DrainOutcome::Completed(report)
    }

    async fn process_task(&self, mut task: SyncTask, report: &mut DrainReport) {
        // Discarded or already handled while earlier tasks were in flight
        match self.store.get::<SyncTask>(task.id.clone()) {
            Ok(Some(current)) if current.status == TaskStatus::Pending => task = current,
            Ok(_) => return,
            Err(e) => {
                tracing::error!("Could not reload task {}: {}", task.id, e);
                report.record_failure(&task, e.to_string(), false);
                return;
            }
        }

        if task.retry_count >= self.policy.max_retries {
            tracing::warn!(
                "Task {} reached {} attempts, marking failed permanently",
                task.id,
                task.retry_count
            );
            task.status = TaskStatus::FailedPermanently;
            if let Err(e) = self.store.put(task.clone()) {
                tracing::error!("Could not park task {}: {}", task.id, e);
            }
            report.record_failure(&task, "retry limit reached".to_string(), true);
            return;
        }

        task.status = TaskStatus::InProgress;
        task.last_attempt = Some(Utc::now());
        if let Err(e) = self.store.put(task.clone()) {
            tracing::error!("Could not mark task {} in progress: {}", task.id, e);
            report.record_failure(&task, e.to_string(), false);
            return;
        }

        tracing::debug!(
            "Delivering {:?} task {} (attempt {})",
            task.kind(),
            task.id,
            task.retry_count + 1
        );

        let attempt = match &task.target {
            SyncTarget::Entry { reading_id } => self.deliver_entry(reading_id).await,
            SyncTarget::Media { media_id } => self.deliver_media(media_id).await,
        };

        match attempt {
            Ok(Delivery::Delivered) => {
                if let Err(e) = self.store.delete::<SyncTask>(task.id.clone()) {
                    tracing::error!("Delivered task {} could not be removed: {}", task.id, e);
                }
                report.synced += 1;
            }
            Ok(Delivery::TargetGone) => {
                tracing::debug!(
                    "Target {} of task {} no longer exists, dropping task",
                    task.target.record_id(),
                    task.id
                );
                if let Err(e) = self.store.delete::<SyncTask>(task.id.clone()) {
                    tracing::error!("Orphaned task {} could not be removed: {}", task.id, e);
                }
            }
            Err(AttemptError::Local(e)) => {
                // The attempt is aborted; the task goes back untouched for the next pass.
                tracing::error!("Local store failure during task {}: {}", task.id, e);
                task.status = TaskStatus::Pending;
                task.last_error = Some(e.to_string());
                self.write_back(&task);
                report.record_failure(&task, e.to_string(), false);
            }
            Err(e) => self.record_attempt_failure(task, e, report),
        }
    }

    fn record_attempt_failure(&self, mut task: SyncTask, error: AttemptError, report: &mut DrainReport) {
        let reason = error.to_string();
        task.last_error = Some(reason.clone());

        let permanent = match error.category() {
            FailureCategory::Configuration => {
                task.status = TaskStatus::Pending;
                false
            }
            category => {
                task.retry_count += 1;
                let give_up = match category {
                    FailureCategory::Permanent => true,
                    FailureCategory::TooLarge => {
                        self.policy.fail_fast_too_large
                            || task.retry_count >= self.policy.max_retries
                    }
                    _ => task.retry_count >= self.policy.max_retries,
                };
                task.status = if give_up {
                    TaskStatus::FailedPermanently
                } else {
                    TaskStatus::Pending
                };
                give_up
            }
        };

        if permanent {
            tracing::warn!(
                "Task {} failed permanently after {} attempts: {}",
                task.id,
                task.retry_count,
                reason
            );
        } else {
            tracing::warn!(
                "Task {} failed (attempt {}), will retry: {}",
                task.id,
                task.retry_count,
                reason
            );
        }

        self.write_back(&task);
        report.record_failure(&task, reason, permanent);
    }

    /// Re-persists a task after an attempt unless it was discarded meanwhile.
    fn write_back(&self, task: &SyncTask) {
        match self.store.get::<SyncTask>(task.id.clone()) {
            Ok(Some(_)) => {
                if let Err(e) = self.store.put(task.clone()) {
                    tracing::error!("Could not record outcome of task {}: {}", task.id, e);
                }
            }
            Ok(None) => tracing::debug!("Task {} was discarded during its attempt", task.id),
            Err(e) => tracing::error!("Could not reload task {}: {}", task.id, e),
        }
    }

    async fn call<T, F>(&self, call: F) -> std::result::Result<T, RemoteError>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match self.policy.gateway_timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(limit)),
            },
            None => call.await,
        }
    }

    async fn deliver_entry(&self, reading_id: &str) -> std::result::Result<Delivery, AttemptError> {
        let Some(reading) = self.store.get_reading(reading_id)? else {
            return Ok(Delivery::TargetGone);
        };

        let links: Vec<String> = self
            .store
            .media_for_reading(reading_id)?
            .iter()
            .filter(|item| item.is_synced())
            .filter_map(|item| item.remote_url().map(str::to_string))
            .collect();

        let row = SheetRow::from_reading(&reading, links);
        // The proxy maps the system id onto its tab and sizes the formula columns from it.
        let receipt = self
            .call(self.gateway.append_reading_row(&reading.system_id, &row))
            .await?;
        tracing::info!(
            "Reading {} appended to {} ({})",
            reading.id,
            systems::sheet_tab_for(&reading.system_id).trim_end(),
            receipt.updated_range.as_deref().unwrap_or("range unknown")
        );

        // An edit made while the row was in flight has its own task; leave it unsynced.
        match self.store.get_reading(reading_id)? {
            Some(mut current) if current.updated_at == reading.updated_at => {
                current.set_synced(true);
                self.store.put(current)?;
            }
            Some(_) => tracing::debug!(
                "Reading {} changed during delivery, leaving it unsynced",
                reading_id
            ),
            None => {}
        }

        Ok(Delivery::Delivered)
    }

    async fn deliver_media(&self, media_id: &str) -> std::result::Result<Delivery, AttemptError> {
        let Some(mut item) = self.store.get_media(media_id)? else {
            tracing::warn!("Media task points at missing media item {}", media_id);
            return Err(AttemptError::MissingMedia(media_id.to_string()));
        };

        if item.is_synced() && item.remote.is_some() {
            return Ok(Delivery::Delivered);
        }

        // A previous attempt may have uploaded the file but failed to share it.
        let remote = match item.remote.clone() {
            Some(remote) => remote,
            None => {
                let upload = MediaUpload {
                    bytes: media::materialize_payload(&item.payload)?,
                    mime_type: item.mime_type.clone(),
                    filename: item.filename.clone(),
                };
                let uploaded = self.call(self.gateway.upload_media(&upload)).await?;
                let remote = RemoteRef {
                    file_id: uploaded.remote_id,
                    view_url: uploaded.view_url,
                };
                item.remote = Some(remote.clone());
                self.store.put(item.clone())?;
                remote
            }
        };

        self.call(self.gateway.make_public(&remote.file_id)).await?;

        item.set_synced(true);
        self.store.put(item)?;
        tracing::info!("Media {} uploaded as {}", media_id, remote.file_id);
        Ok(Delivery::Delivered)
    }
}
