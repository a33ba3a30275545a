//! WebSocket push producer: subscribes to a live-prices feed and keeps a
//! rolling cache of the latest sample per channel, nudging the sync
//! coordinator whenever a fresh price lands.
//!
//! Reconnects with exponential backoff and resubscribes from scratch on
//! every new socket, matching the behavior of the polling REST producer it
//! backs up for ([`super::pull`]).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::config::AmberConfig;
use crate::domain::{AdvancedPrice, ChannelType, ForecastType, IntervalKind, PriceInterval, PriceSourceError};

use super::{HealthStatus, PriceCache, PriceSource};

const MAX_BACKOFF_SECS: u64 = 60;

/// Live-prices WebSocket client for one site.
pub struct AmberPushClient {
    ws_url: String,
    api_key: String,
    site_id: String,
    ping_interval: StdDuration,
    ping_timeout: StdDuration,
    sync_cooldown: chrono::Duration,
    forecast_type: ForecastType,

    cache: Arc<RwLock<PriceCache>>,
    forecast_cache: Arc<RwLock<Vec<PriceInterval>>>,
    connected: Arc<std::sync::atomic::AtomicBool>,
    message_count: Arc<AtomicU64>,
    error_count: Arc<AtomicU64>,
    last_error: Arc<RwLock<Option<String>>>,
    last_sync_trigger: Arc<RwLock<Option<DateTime<Utc>>>>,
    sync_notify: mpsc::Sender<()>,
}

impl AmberPushClient {
    pub fn new(
        cfg: &AmberConfig,
        site_id: String,
        forecast_type: ForecastType,
        sync_notify: mpsc::Sender<()>,
    ) -> Self {
        Self {
            ws_url: cfg.ws_url.clone(),
            api_key: cfg.api_key.clone(),
            site_id,
            ping_interval: StdDuration::from_secs(cfg.ws_ping_interval_secs),
            ping_timeout: StdDuration::from_secs(cfg.ws_ping_timeout_secs),
            sync_cooldown: chrono::Duration::seconds(cfg.sync_cooldown_secs as i64),
            forecast_type,
            cache: Arc::new(RwLock::new(PriceCache::default())),
            forecast_cache: Arc::new(RwLock::new(Vec::new())),
            connected: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            message_count: Arc::new(AtomicU64::new(0)),
            error_count: Arc::new(AtomicU64::new(0)),
            last_error: Arc::new(RwLock::new(None)),
            last_sync_trigger: Arc::new(RwLock::new(None)),
            sync_notify,
        }
    }

    /// Runs the reconnect loop until the process shuts down. Intended to be
    /// handed to `tokio::spawn` once at startup.
    pub async fn run_forever(self: Arc<Self>) {
        let mut backoff = 1u64;
        loop {
            match self.connect_and_stream().await {
                Ok(()) => {
                    info!(site = %self.site_id, "websocket stream ended cleanly, reconnecting");
                    backoff = 1;
                }
                Err(e) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.error_count.fetch_add(1, Ordering::Relaxed);
                    *self.last_error.write().await = Some(e.to_string());
                    warn!(site = %self.site_id, error = %e, backoff_secs = backoff, "websocket connection lost");
                }
            }
            tokio::time::sleep(StdDuration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
        }
    }

    async fn connect_and_stream(&self) -> Result<(), PriceSourceError> {
        let mut request = self
            .ws_url
            .clone()
            .into_client_request()
            .map_err(|e| PriceSourceError::ClientError(e.to_string()))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| PriceSourceError::ClientError("invalid api key header".to_string()))?,
        );

        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let subscribe = serde_json::json!({
            "service": "live-prices",
            "action": "subscribe",
            "data": { "siteId": self.site_id },
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| PriceSourceError::TransientHttp(e.to_string()))?;

        let mut ping_tick = tokio::time::interval(self.ping_interval);
        ping_tick.tick().await; // first tick fires immediately

        loop {
            tokio::select! {
                _ = ping_tick.tick() => {
                    if timeout(self.ping_timeout, write.send(Message::Ping(Vec::new()))).await.is_err() {
                        return Err(PriceSourceError::WsConnectionLost("ping timed out".to_string()));
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.message_count.fetch_add(1, Ordering::Relaxed);
                            self.connected.store(true, Ordering::SeqCst);
                            self.handle_message(&text).await;
                        }
                        Some(Ok(Message::Pong(_))) => debug!("pong received"),
                        Some(Ok(Message::Close(frame))) => {
                            return Err(PriceSourceError::WsConnectionLost(
                                frame.map(|f| f.reason.to_string()).unwrap_or_else(|| "closed by server".to_string()),
                            ));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(PriceSourceError::WsConnectionLost(e.to_string())),
                        None => return Err(PriceSourceError::WsConnectionLost("stream ended".to_string())),
                    }
                }
            }
        }
    }

    async fn handle_message(&self, text: &str) {
        let envelope: WireEnvelope = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "could not parse websocket message");
                return;
            }
        };

        if envelope.action.as_deref() == Some("subscribe") && envelope.status == Some(200) {
            info!(site = %self.site_id, "live-prices subscription acknowledged");
            return;
        }

        if envelope.action.as_deref() == Some("price-update") {
            let Some(data) = envelope.data else { return };
            if let Some(site_id) = &data.site_id {
                if site_id != &self.site_id {
                    warn!(site = %self.site_id, other_site = %site_id, "received price update for different site");
                    return;
                }
            }
            let mut touched = false;
            for raw in data.prices {
                if let Some(interval) = raw.into_interval() {
                    self.cache.write().await.update(interval);
                    touched = true;
                }
            }
            if touched {
                self.maybe_trigger_sync().await;
            }
            return;
        }

        match envelope.kind.as_deref() {
            Some("subscription-success") => {
                info!(site = %self.site_id, "live-prices subscription acknowledged");
            }
            Some("error") => {
                let message = envelope.message.unwrap_or_else(|| "unknown error".to_string());
                self.error_count.fetch_add(1, Ordering::Relaxed);
                *self.last_error.write().await = Some(message.clone());
                error!(site = %self.site_id, %message, "live-prices feed reported an error");
            }
            other => debug!(kind = ?other, "ignoring unrecognized websocket message"),
        }
    }

    /// Fires the sync notification at most once per cooldown window,
    /// without blocking the read loop — a full coordinator-claimed sync can
    /// take longer than the interval between price ticks.
    async fn maybe_trigger_sync(&self) {
        let now = Utc::now();
        {
            let mut last = self.last_sync_trigger.write().await;
            if let Some(prev) = *last {
                if now - prev < self.sync_cooldown {
                    return;
                }
            }
            *last = Some(now);
        }
        if self.sync_notify.try_send(()).is_err() {
            debug!("sync notification channel full, coordinator already has a pending wakeup");
        }
    }
}

#[async_trait]
impl PriceSource for AmberPushClient {
    async fn current_prices(&self, max_age: chrono::Duration) -> Result<Vec<PriceInterval>, PriceSourceError> {
        self.cache
            .read()
            .await
            .snapshot(max_age)
            .ok_or_else(|| PriceSourceError::WsConnectionLost("no cached price within max age".to_string()))
    }

    async fn forecast(&self) -> Result<Vec<PriceInterval>, PriceSourceError> {
        let cached = self.forecast_cache.read().await;
        if cached.is_empty() {
            return Err(PriceSourceError::ClientError("no forecast cached from push feed".to_string()));
        }
        Ok(cached.clone())
    }

    fn health(&self) -> HealthStatus {
        let last_update = self.cache.try_read().ok().and_then(|c| c.last_update());
        HealthStatus {
            connected: self.connected.load(Ordering::SeqCst),
            last_update,
            age_seconds: last_update.map(|ts| (Utc::now() - ts).num_seconds()),
            message_count: self.message_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            last_error: self.last_error.try_read().ok().and_then(|e| e.clone()),
            has_cached_data: last_update.is_some(),
        }
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// Top-level frame shape of the live-prices feed: the ack and
/// price-update frames are keyed on `action`/`status`, not `type` —
/// `type` only appears on the `error` and legacy `subscription-success`
/// frames.
#[derive(Debug, Deserialize)]
struct WireEnvelope {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<WireData>,
}

#[derive(Debug, Deserialize)]
struct WireData {
    #[serde(default, rename = "siteId")]
    site_id: Option<String>,
    #[serde(default)]
    prices: Vec<WireChannelPrice>,
}

#[derive(Debug, Deserialize)]
struct WireChannelPrice {
    #[serde(rename = "type")]
    interval_kind: Option<String>,
    #[serde(rename = "channelType")]
    channel_type: Option<String>,
    #[serde(rename = "nemTime")]
    nem_time: Option<DateTime<chrono::FixedOffset>>,
    duration: Option<i64>,
    #[serde(rename = "perKwh")]
    per_kwh: Option<f64>,
    #[serde(rename = "advancedPrice")]
    advanced_price: Option<WireAdvancedPrice>,
}

#[derive(Debug, Deserialize)]
struct WireAdvancedPrice {
    predicted: f64,
    low: f64,
    high: f64,
}

impl WireChannelPrice {
    fn into_interval(self) -> Option<PriceInterval> {
        let channel = match self.channel_type?.as_str() {
            "general" => ChannelType::General,
            "feedIn" => ChannelType::FeedIn,
            _ => return None,
        };
        let kind = match self.interval_kind.as_deref() {
            Some("ActualInterval") => IntervalKind::ActualInterval,
            Some("ForecastInterval") => IntervalKind::ForecastInterval,
            _ => IntervalKind::CurrentInterval,
        };
        let advanced = self.advanced_price.map(|a| AdvancedPrice { predicted: a.predicted, low: a.low, high: a.high });
        Some(PriceInterval::ingest(self.nem_time?, self.duration.unwrap_or(5), channel, kind, self.per_kwh?, advanced))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_price_parses_general_current_interval() {
        let raw = WireChannelPrice {
            interval_kind: Some("CurrentInterval".to_string()),
            channel_type: Some("general".to_string()),
            nem_time: Some("2024-06-10T15:05:00+10:00".parse().unwrap()),
            duration: Some(5),
            per_kwh: Some(32.5),
            advanced_price: None,
        };
        let interval = raw.into_interval().unwrap();
        assert_eq!(interval.channel_type, ChannelType::General);
        assert_eq!(interval.per_kwh, 32.5);
    }

    #[test]
    fn channel_price_negates_feed_in() {
        let raw = WireChannelPrice {
            interval_kind: Some("CurrentInterval".to_string()),
            channel_type: Some("feedIn".to_string()),
            nem_time: Some("2024-06-10T15:05:00+10:00".parse().unwrap()),
            duration: Some(5),
            per_kwh: Some(-8.0),
            advanced_price: None,
        };
        let interval = raw.into_interval().unwrap();
        assert_eq!(interval.per_kwh, 8.0);
    }

    #[test]
    fn unrecognized_channel_type_is_dropped() {
        let raw = WireChannelPrice {
            interval_kind: Some("CurrentInterval".to_string()),
            channel_type: Some("controlledLoad".to_string()),
            nem_time: Some("2024-06-10T15:05:00+10:00".parse().unwrap()),
            duration: Some(5),
            per_kwh: Some(1.0),
            advanced_price: None,
        };
        assert!(raw.into_interval().is_none());
    }
}
