//! REST poll producer: the fallback path when the websocket feed is down,
//! and the sole source of the 48-hour forecast the tariff builder needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::AmberConfig;
use crate::domain::{AdvancedPrice, ChannelType, ForecastType, IntervalKind, PriceInterval, PriceSourceError};

use super::{HealthStatus, PriceCache, PriceSource};

/// Polls `GET /sites/{siteId}/prices/current` on an interval, caching both
/// the in-progress sample (for [`PriceSource::current_prices`]) and the
/// full returned window (for [`PriceSource::forecast`]).
pub struct AmberPullClient {
    client: ClientWithMiddleware,
    base_url: String,
    api_key: String,
    site_id: String,
    forecast_type: ForecastType,
    poll_interval: StdDuration,

    cache: Arc<RwLock<PriceCache>>,
    forecast_cache: Arc<RwLock<Option<(DateTime<Utc>, Vec<PriceInterval>)>>>,
    forecast_ttl: chrono::Duration,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    last_success: Arc<RwLock<Option<DateTime<Utc>>>>,
}

impl AmberPullClient {
    pub fn new(cfg: &AmberConfig, site_id: String, forecast_type: ForecastType) -> anyhow::Result<Self> {
        let inner = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .user_agent("open-energy-controller/0.2")
            .build()?;
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(3);
        let client = ClientBuilder::new(inner)
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Ok(Self {
            client,
            base_url: cfg.rest_base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
            site_id,
            forecast_type,
            poll_interval: StdDuration::from_secs(cfg.rest_poll_interval_secs),
            cache: Arc::new(RwLock::new(PriceCache::default())),
            forecast_cache: Arc::new(RwLock::new(None)),
            forecast_ttl: chrono::Duration::seconds(cfg.rest_poll_interval_secs as i64 * 2),
            message_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            last_success: Arc::new(RwLock::new(None)),
        })
    }

    /// Polls on `poll_interval` until the process shuts down.
    pub async fn run_forever(self: Arc<Self>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tick.tick().await;
            if let Err(e) = self.refresh().await {
                self.error_count.fetch_add(1, Ordering::Relaxed);
                *self.last_error.write().await = Some(e.to_string());
                warn!(site = %self.site_id, error = %e, "price poll failed");
            }
        }
    }

    async fn refresh(&self) -> Result<(), PriceSourceError> {
        let intervals = self.fetch_prices().await?;
        self.message_count.fetch_add(1, Ordering::Relaxed);
        *self.last_success.write().await = Some(Utc::now());

        let mut cache = self.cache.write().await;
        for interval in intervals.iter().filter(|i| matches!(i.kind, IntervalKind::CurrentInterval)) {
            cache.update(interval.clone());
        }
        drop(cache);

        *self.forecast_cache.write().await = Some((Utc::now(), intervals));
        Ok(())
    }

    async fn fetch_prices(&self) -> Result<Vec<PriceInterval>, PriceSourceError> {
        let url = format!("{}/sites/{}/prices/current?next=96&previous=0&resolution=30", self.base_url, self.site_id);
        let resp = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(PriceSourceError::ClientError(format!("HTTP {status}: unauthorized")));
        }
        if !status.is_success() {
            return Err(PriceSourceError::TransientHttp(format!("HTTP {status}")));
        }

        let raw: Vec<WireInterval> = resp.json().await.map_err(|e| PriceSourceError::ParseError(e.to_string()))?;
        Ok(raw.into_iter().filter_map(WireInterval::into_interval).collect())
    }
}

#[async_trait]
impl PriceSource for AmberPullClient {
    async fn current_prices(&self, max_age: chrono::Duration) -> Result<Vec<PriceInterval>, PriceSourceError> {
        self.cache
            .read()
            .await
            .snapshot(max_age)
            .ok_or_else(|| PriceSourceError::ClientError("no cached price within max age".to_string()))
    }

    async fn forecast(&self) -> Result<Vec<PriceInterval>, PriceSourceError> {
        {
            let cached = self.forecast_cache.read().await;
            if let Some((ts, intervals)) = cached.as_ref() {
                if Utc::now() - *ts < self.forecast_ttl {
                    return Ok(intervals.clone());
                }
            }
        }
        info!(site = %self.site_id, "forecast cache stale, refreshing");
        self.refresh().await?;
        let cached = self.forecast_cache.read().await;
        cached.as_ref().map(|(_, i)| i.clone()).ok_or_else(|| PriceSourceError::ParseError("empty forecast".to_string()))
    }

    fn health(&self) -> HealthStatus {
        let last_update = self.last_success.try_read().ok().and_then(|t| *t);
        HealthStatus {
            connected: last_update.is_some(),
            last_update,
            age_seconds: last_update.map(|ts| (Utc::now() - ts).num_seconds()),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.try_read().ok().and_then(|e| e.clone()),
            has_cached_data: last_update.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireInterval {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "channelType")]
    channel_type: String,
    #[serde(rename = "nemTime")]
    nem_time: DateTime<chrono::FixedOffset>,
    duration: i64,
    #[serde(rename = "perKwh")]
    per_kwh: f64,
    #[serde(rename = "advancedPrice")]
    advanced_price: Option<WireAdvancedPrice>,
}

#[derive(Debug, Deserialize)]
struct WireAdvancedPrice {
    predicted: f64,
    low: f64,
    high: f64,
}

impl WireInterval {
    fn into_interval(self) -> Option<PriceInterval> {
        let channel = match self.channel_type.as_str() {
            "general" => ChannelType::General,
            "feedIn" => ChannelType::FeedIn,
            _ => return None,
        };
        let kind = match self.kind.as_str() {
            "ActualInterval" => IntervalKind::ActualInterval,
            "ForecastInterval" => IntervalKind::ForecastInterval,
            "CurrentInterval" => IntervalKind::CurrentInterval,
            _ => return None,
        };
        let advanced = self.advanced_price.map(|a| AdvancedPrice { predicted: a.predicted, low: a.low, high: a.high });
        Some(PriceInterval::ingest(self.nem_time, self.duration, channel, kind, self.per_kwh, advanced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_interval_parses_forecast_kind() {
        let raw = WireInterval {
            kind: "ForecastInterval".to_string(),
            channel_type: "general".to_string(),
            nem_time: "2024-06-10T15:30:00+10:00".parse().unwrap(),
            duration: 30,
            per_kwh: 25.0,
            advanced_price: Some(WireAdvancedPrice { predicted: 25.0, low: 20.0, high: 30.0 }),
        };
        let interval = raw.into_interval().unwrap();
        assert_eq!(interval.kind, IntervalKind::ForecastInterval);
        assert_eq!(interval.advanced_price.unwrap().predicted, 25.0);
    }

    #[test]
    fn wire_interval_drops_unknown_kind() {
        let raw = WireInterval {
            kind: "WeirdInterval".to_string(),
            channel_type: "general".to_string(),
            nem_time: "2024-06-10T15:30:00+10:00".parse().unwrap(),
            duration: 30,
            per_kwh: 25.0,
            advanced_price: None,
        };
        assert!(raw.into_interval().is_none());
    }
}
