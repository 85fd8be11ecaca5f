//! Cached read-through weather lookup for pre-filling environmental fields.
//!
//! Entries are keyed by date and kept forever. A cached value past its
//! freshness window is only served when a live fetch fails.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::Deserialize;
use std::sync::Arc;

use crate::gateway::RemoteError;
use crate::models::{WeatherCacheEntry, WeatherCondition, WeatherData};
use crate::store::LocalStore;

pub const DEFAULT_WEATHER_URL: &str = "https://api.open-meteo.com/v1/forecast";
pub const DEFAULT_TTL_HOURS: i64 = 6;

#[async_trait]
pub trait WeatherSource: Send + Sync {
    /// Today's conditions at a site.
    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<WeatherData, RemoteError>;
}

#[derive(Debug, Deserialize)]
struct ForecastResponse {
    current: CurrentConditions,
    daily: DailyRange,
}

#[derive(Debug, Deserialize)]
struct CurrentConditions {
    temperature_2m: f64,
    weather_code: i32,
}

#[derive(Debug, Deserialize)]
struct DailyRange {
    temperature_2m_max: Vec<f64>,
    temperature_2m_min: Vec<f64>,
}

/// Maps an Open-Meteo forecast body to [`WeatherData`], rounding temperatures to whole degrees.
pub fn parse_forecast(body: &str) -> Result<WeatherData, RemoteError> {
    let forecast: ForecastResponse = serde_json::from_str(body)
        .map_err(|e| RemoteError::InvalidResponse(format!("forecast body: {}", e)))?;

    let (Some(max), Some(min)) = (
        forecast.daily.temperature_2m_max.first(),
        forecast.daily.temperature_2m_min.first(),
    ) else {
        return Err(RemoteError::InvalidResponse(
            "forecast has no daily range".to_string(),
        ));
    };

    Ok(WeatherData {
        condition: WeatherCondition::from_wmo_code(forecast.current.weather_code),
        weather_code: forecast.current.weather_code,
        current_temp: forecast.current.temperature_2m.round(),
        min_temp: min.round(),
        max_temp: max.round(),
    })
}

#[derive(Debug, Clone)]
pub struct OpenMeteoClient {
    http_client: reqwest::Client,
    url: String,
}

impl OpenMeteoClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http_client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl Default for OpenMeteoClient {
    fn default() -> Self {
        Self::new(DEFAULT_WEATHER_URL)
    }
}

#[async_trait]
impl WeatherSource for OpenMeteoClient {
    async fn fetch(&self, latitude: f64, longitude: f64) -> Result<WeatherData, RemoteError> {
        let response = self
            .http_client
            .get(&self.url)
            .query(&[
                ("latitude", latitude.to_string()),
                ("longitude", longitude.to_string()),
                ("current", "temperature_2m,weather_code".to_string()),
                ("daily", "temperature_2m_max,temperature_2m_min".to_string()),
                ("timezone", "auto".to_string()),
                ("forecast_days", "1".to_string()),
            ])
            .send()
            .await
            .map_err(|e| RemoteError::Transport(format!("weather request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RemoteError::Transport(format!("weather body unreadable: {}", e)))?;
        if !status.is_success() {
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }

        parse_forecast(&body)
    }
}

pub struct WeatherService {
    store: Arc<LocalStore>,
    source: Arc<dyn WeatherSource>,
    ttl: Duration,
}

impl WeatherService {
    pub fn new(store: Arc<LocalStore>, source: Arc<dyn WeatherSource>, ttl: Duration) -> Self {
        Self { store, source, ttl }
    }

    /// Fresh cache hit, else a live fetch, else whatever stale value is cached.
    /// `None` only when the fetch fails and nothing was ever cached for the date.
    pub async fn lookup(&self, date: &str, latitude: f64, longitude: f64) -> Option<WeatherData> {
        let cached = match self.store.cached_weather(date) {
            Ok(cached) => cached,
            Err(e) => {
                tracing::warn!("Weather cache unreadable, fetching live: {}", e);
                None
            }
        };

        if let Some(entry) = &cached {
            if Utc::now() - entry.fetched_at < self.ttl {
                return Some(entry.data.clone());
            }
        }

        match self.source.fetch(latitude, longitude).await {
            Ok(data) => {
                let entry = WeatherCacheEntry {
                    date: date.to_string(),
                    data: data.clone(),
                    fetched_at: Utc::now(),
                };
                if let Err(e) = self.store.put(entry) {
                    tracing::warn!("Could not cache weather for {}: {}", date, e);
                }
                Some(data)
            }
            Err(e) => match cached {
                Some(entry) => {
                    tracing::warn!(
                        "Weather fetch failed, using cache from {}: {}",
                        entry.fetched_at,
                        e
                    );
                    Some(entry.data)
                }
                None => {
                    tracing::warn!("Weather fetch failed and nothing cached for {}: {}", date, e);
                    None
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    struct ScriptedSource {
        calls: AtomicUsize,
        result: Result<WeatherData, RemoteError>,
    }

    #[async_trait]
    impl WeatherSource for ScriptedSource {
        async fn fetch(&self, _lat: f64, _lon: f64) -> Result<WeatherData, RemoteError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.result.clone()
        }
    }

    fn sample(condition: WeatherCondition, max: f64) -> WeatherData {
        WeatherData {
            condition,
            weather_code: 3,
            current_temp: 12.0,
            min_temp: 7.0,
            max_temp: max,
        }
    }

    fn setup(
        result: Result<WeatherData, RemoteError>,
    ) -> (TempDir, Arc<LocalStore>, Arc<ScriptedSource>, WeatherService) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(
            LocalStore::open(dir.path().join("w.db"), dir.path().join("blobs")).unwrap(),
        );
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            result,
        });
        let service = WeatherService::new(
            store.clone(),
            source.clone(),
            Duration::hours(DEFAULT_TTL_HOURS),
        );
        (dir, store, source, service)
    }

    fn cache(store: &LocalStore, data: WeatherData, age_hours: i64) {
        store
            .put(WeatherCacheEntry {
                date: "2025-04-01".to_string(),
                data,
                fetched_at: Utc::now() - Duration::hours(age_hours),
            })
            .unwrap();
    }

    #[test]
    fn test_parse_forecast_rounds_and_maps() {
        let body = r#"{
            "current": {"temperature_2m": 12.6, "weather_code": 61},
            "daily": {"temperature_2m_max": [17.4], "temperature_2m_min": [6.5]}
        }"#;
        let data = parse_forecast(body).unwrap();
        assert_eq!(data.condition, WeatherCondition::Rain);
        assert_eq!(data.current_temp, 13.0);
        assert_eq!(data.max_temp, 17.0);
        assert_eq!(data.min_temp, 7.0);

        let empty = r#"{"current": {"temperature_2m": 1.0, "weather_code": 0},
            "daily": {"temperature_2m_max": [], "temperature_2m_min": []}}"#;
        assert!(matches!(
            parse_forecast(empty),
            Err(RemoteError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_fresh_cache_skips_fetch() {
        let (_dir, store, source, service) =
            setup(Ok(sample(WeatherCondition::Sunny, 20.0)));
        cache(&store, sample(WeatherCondition::Fog, 11.0), 1);

        let data = service.lookup("2025-04-01", -39.06, 174.08).await.unwrap();
        assert_eq!(data.condition, WeatherCondition::Fog);
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_stale_cache_is_refreshed() {
        let (_dir, store, source, service) =
            setup(Ok(sample(WeatherCondition::Sunny, 20.0)));
        cache(&store, sample(WeatherCondition::Fog, 11.0), 7);

        let data = service.lookup("2025-04-01", -39.06, 174.08).await.unwrap();
        assert_eq!(data.condition, WeatherCondition::Sunny);
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
        let stored = store.cached_weather("2025-04-01").unwrap().unwrap();
        assert_eq!(stored.data.max_temp, 20.0);
    }

    #[tokio::test]
    async fn test_stale_cache_served_when_fetch_fails() {
        let (_dir, store, _source, service) =
            setup(Err(RemoteError::Transport("offline".to_string())));
        cache(&store, sample(WeatherCondition::Fog, 11.0), 30);

        let data = service.lookup("2025-04-01", -39.06, 174.08).await.unwrap();
        assert_eq!(data.condition, WeatherCondition::Fog);
    }

    #[tokio::test]
    async fn test_miss_when_fetch_fails_and_nothing_cached() {
        let (_dir, _store, source, service) =
            setup(Err(RemoteError::Transport("offline".to_string())));
        assert!(service.lookup("2025-04-01", -39.06, 174.08).await.is_none());
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
