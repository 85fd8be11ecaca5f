#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use compost_sync::gateway::{
    AppendReceipt, MediaUpload, RemoteError, RemoteGateway, SheetRow, UploadedMedia,
};
use compost_sync::models::WeatherData;
use compost_sync::sync::SyncPolicy;
use compost_sync::weather::WeatherSource;
use compost_sync::{AppContext, ContextOptions};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Append { system_id: String, row: SheetRow },
    Upload { filename: String, size: usize },
    MakePublic { remote_id: String },
}

type AppendHook = Box<dyn Fn(&SheetRow) + Send + Sync>;

/// Gateway double: records every call and answers from a script.
/// Appends and uploads pop the next scripted outcome; share calls have their
/// own script. An empty script succeeds.
#[derive(Default)]
pub struct ScriptedGateway {
    calls: Mutex<Vec<Call>>,
    script: Mutex<VecDeque<Result<(), RemoteError>>>,
    share_script: Mutex<VecDeque<Result<(), RemoteError>>>,
    fail_all: Mutex<Option<RemoteError>>,
    delay: Mutex<Option<Duration>>,
    on_append: Mutex<Option<AppendHook>>,
}

impl ScriptedGateway {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_outcome(&self, outcome: Result<(), RemoteError>) {
        self.script.lock().unwrap().push_back(outcome);
    }

    pub fn push_share_outcome(&self, outcome: Result<(), RemoteError>) {
        self.share_script.lock().unwrap().push_back(outcome);
    }

    /// Every append and upload sleeps this long before answering.
    pub fn hang_for(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Runs while a row is "in flight", after it was recorded and before it is answered.
    pub fn on_append(&self, hook: impl Fn(&SheetRow) + Send + Sync + 'static) {
        *self.on_append.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn fail_with(&self, error: Option<RemoteError>) {
        *self.fail_all.lock().unwrap() = error;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn appends(&self) -> Vec<SheetRow> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Append { row, .. } => Some(row),
                _ => None,
            })
            .collect()
    }

    async fn wait(&self) {
        let delay = *self.delay.lock().unwrap();
        match delay {
            Some(delay) => tokio::time::sleep(delay).await,
            None => tokio::task::yield_now().await,
        }
    }

    fn next_outcome(&self) -> Result<(), RemoteError> {
        if let Some(error) = self.fail_all.lock().unwrap().clone() {
            return Err(error);
        }
        self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

#[async_trait]
impl RemoteGateway for ScriptedGateway {
    async fn append_reading_row(
        &self,
        system_id: &str,
        row: &SheetRow,
    ) -> Result<AppendReceipt, RemoteError> {
        self.calls.lock().unwrap().push(Call::Append {
            system_id: system_id.to_string(),
            row: row.clone(),
        });
        if let Some(hook) = self.on_append.lock().unwrap().as_ref() {
            hook(row);
        }
        self.wait().await;
        self.next_outcome()?;
        Ok(AppendReceipt {
            updated_range: Some(format!("'{}'!A2:V2", system_id)),
        })
    }

    async fn upload_media(&self, upload: &MediaUpload) -> Result<UploadedMedia, RemoteError> {
        self.calls.lock().unwrap().push(Call::Upload {
            filename: upload.filename.clone(),
            size: upload.bytes.len(),
        });
        self.wait().await;
        self.next_outcome()?;
        Ok(UploadedMedia {
            remote_id: format!("file-{}", upload.filename),
            view_url: format!("https://drive.example/view/{}", upload.filename),
        })
    }

    async fn make_public(&self, remote_id: &str) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(Call::MakePublic {
            remote_id: remote_id.to_string(),
        });
        self.share_script.lock().unwrap().pop_front().unwrap_or(Ok(()))
    }
}

/// Weather source that is never reachable
pub struct NoWeather;

#[async_trait]
impl WeatherSource for NoWeather {
    async fn fetch(&self, _latitude: f64, _longitude: f64) -> Result<WeatherData, RemoteError> {
        Err(RemoteError::Transport("no network in tests".to_string()))
    }
}

pub fn test_options(dir: &TempDir) -> ContextOptions {
    let mut options = ContextOptions::new(dir.path().join("compost.db"), dir.path().join("blobs"));
    options.policy = SyncPolicy {
        gateway_timeout: Some(Duration::from_secs(5)),
        ..SyncPolicy::default()
    };
    options
}

pub fn open_context(dir: &TempDir, gateway: Arc<ScriptedGateway>) -> AppContext {
    open_context_with(test_options(dir), gateway)
}

pub fn open_context_with(options: ContextOptions, gateway: Arc<ScriptedGateway>) -> AppContext {
    AppContext::open_with(options, gateway, Arc::new(NoWeather)).expect("open context")
}
