//! C1: price producers. Two independent feeds populate the same cache
//! shape — a push feed (WebSocket, sub-minute latency) and a pull feed
//! (REST poll, the fallback when the socket is down). C4 reads whichever
//! is freshest through [`PriceSource::current_prices`].

pub mod pull;
pub mod push;
pub mod wholesale;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{ChannelType, PriceInterval, PriceSourceError};

/// A source of live/forecast price intervals for one site.
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Returns the latest cached prices, erroring if the cache is older
    /// than `max_age` or has never been populated.
    async fn current_prices(&self, max_age: chrono::Duration) -> Result<Vec<PriceInterval>, PriceSourceError>;

    /// Returns the 48-hour forward forecast (today + tomorrow, 30-minute
    /// buckets) consumed by the tariff builder's rolling window.
    async fn forecast(&self) -> Result<Vec<PriceInterval>, PriceSourceError>;

    fn health(&self) -> HealthStatus;
}

/// Snapshot of a producer's connectivity, mirroring the fields the push
/// client exposes to the administrative status endpoint.
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    pub connected: bool,
    pub last_update: Option<DateTime<Utc>>,
    pub age_seconds: Option<i64>,
    pub message_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub has_cached_data: bool,
}

/// In-memory latest-price cache shared by both producers: one slot per
/// channel, each independently timestamped (general and feed-in update on
/// different messages over the wire).
#[derive(Debug, Clone, Default)]
pub(crate) struct PriceCache {
    pub general: Option<(DateTime<Utc>, PriceInterval)>,
    pub feed_in: Option<(DateTime<Utc>, PriceInterval)>,
}

impl PriceCache {
    pub(crate) fn update(&mut self, interval: PriceInterval) {
        let now = Utc::now();
        match interval.channel_type {
            ChannelType::General => self.general = Some((now, interval)),
            ChannelType::FeedIn => self.feed_in = Some((now, interval)),
        }
    }

    pub(crate) fn snapshot(&self, max_age: chrono::Duration) -> Option<Vec<PriceInterval>> {
        let now = Utc::now();
        let fresh = |entry: &Option<(DateTime<Utc>, PriceInterval)>| {
            entry.as_ref().filter(|(ts, _)| now - *ts <= max_age).map(|(_, i)| i.clone())
        };
        let general = fresh(&self.general);
        let feed_in = fresh(&self.feed_in);
        match (general, feed_in) {
            (None, None) => None,
            (g, f) => Some(g.into_iter().chain(f).collect()),
        }
    }

    pub(crate) fn last_update(&self) -> Option<DateTime<Utc>> {
        [self.general.as_ref().map(|(t, _)| *t), self.feed_in.as_ref().map(|(t, _)| *t)]
            .into_iter()
            .flatten()
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IntervalKind;
    use chrono::FixedOffset;

    fn interval(channel: ChannelType) -> PriceInterval {
        PriceInterval::ingest(Utc::now().fixed_offset(), 5, channel, IntervalKind::CurrentInterval, 20.0, None)
    }

    #[test]
    fn snapshot_requires_at_least_one_fresh_channel() {
        let cache = PriceCache::default();
        assert!(cache.snapshot(chrono::Duration::seconds(10)).is_none());

        let mut cache = PriceCache::default();
        cache.update(interval(ChannelType::General));
        let snap = cache.snapshot(chrono::Duration::seconds(10)).unwrap();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn snapshot_excludes_stale_entries() {
        let mut cache = PriceCache::default();
        cache.general = Some((Utc::now() - chrono::Duration::seconds(120), interval(ChannelType::General)));
        assert!(cache.snapshot(chrono::Duration::seconds(10)).is_none());
    }

    #[test]
    fn fixed_offset_timestamps_round_trip_through_ingest() {
        let offset = FixedOffset::east_opt(10 * 3600).unwrap();
        let ts = Utc::now().with_timezone(&offset);
        let i = PriceInterval::ingest(ts, 5, ChannelType::General, IntervalKind::CurrentInterval, 20.0, None);
        assert_eq!(i.nem_time, ts);
    }
}
