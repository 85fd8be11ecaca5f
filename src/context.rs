//! Process-scoped context: owns the store handle and the services built on
//! it, with an explicit open and shutdown.

use chrono::Duration as ChronoDuration;
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::gateway::{HttpGateway, RemoteGateway};
use crate::models::AppSettings;
use crate::store::LocalStore;
use crate::sync::{SyncEngine, SyncPolicy};
use crate::weather::{OpenMeteoClient, WeatherService, WeatherSource, DEFAULT_TTL_HOURS};

#[derive(Debug, Clone)]
pub struct ContextOptions {
    pub db_path: PathBuf,
    pub blob_dir: PathBuf,
    pub policy: SyncPolicy,
    pub weather_ttl: ChronoDuration,
}

impl ContextOptions {
    pub fn new(db_path: impl Into<PathBuf>, blob_dir: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            blob_dir: blob_dir.into(),
            policy: SyncPolicy::default(),
            weather_ttl: ChronoDuration::hours(DEFAULT_TTL_HOURS),
        }
    }
}

pub struct AppContext {
    pub store: Arc<LocalStore>,
    pub engine: Arc<SyncEngine>,
    pub weather: Arc<WeatherService>,
    /// App configuration as read at open
    pub settings: AppSettings,
}

impl AppContext {
    /// Opens the context against the HTTP gateway and Open-Meteo described by `config`.
    pub fn open(config: &Config) -> Result<Self> {
        let gateway = HttpGateway::new(config.gateway_config())?;
        let options = ContextOptions {
            db_path: config.db_path.clone(),
            blob_dir: config.blob_dir.clone(),
            policy: config.sync_policy(),
            weather_ttl: config.weather_ttl(),
        };
        Self::open_with(
            options,
            Arc::new(gateway),
            Arc::new(OpenMeteoClient::new(config.weather_url.clone())),
        )
    }

    /// Opens the store, returns tasks stranded by an interrupted pass to the
    /// queue and loads the app configuration.
    pub fn open_with(
        options: ContextOptions,
        gateway: Arc<dyn RemoteGateway>,
        weather_source: Arc<dyn WeatherSource>,
    ) -> Result<Self> {
        let store = Arc::new(LocalStore::open(&options.db_path, &options.blob_dir)?);

        let recovered = store.recover_interrupted_tasks()?;
        if recovered > 0 {
            tracing::warn!(
                "Returned {} interrupted sync tasks to the queue",
                recovered
            );
        }

        let settings = store.load_settings()?;
        let engine = Arc::new(SyncEngine::new(store.clone(), gateway, options.policy));
        let weather = Arc::new(WeatherService::new(
            store.clone(),
            weather_source,
            options.weather_ttl,
        ));

        tracing::info!(
            "Context open at {} with {} outstanding sync tasks",
            options.db_path.display(),
            store.outstanding_task_count()?
        );

        Ok(Self {
            store,
            engine,
            weather,
            settings,
        })
    }

    /// Releases every service and closes the store. Fails if a clone of the
    /// store handle is still alive elsewhere.
    pub fn shutdown(self) -> Result<()> {
        let AppContext {
            store,
            engine,
            weather,
            ..
        } = self;
        drop(engine);
        drop(weather);

        match Arc::try_unwrap(store) {
            Ok(store) => {
                store.close();
                Ok(())
            }
            Err(_) => Err(Error::Busy(
                "local store is still in use and cannot be closed".to_string(),
            )),
        }
    }
}
