//! Price interval types shared by the push and pull producers (C1).

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which side of the meter a price applies to.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChannelType {
    General,
    FeedIn,
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelType::General => write!(f, "general"),
            ChannelType::FeedIn => write!(f, "feedIn"),
        }
    }
}

/// An interval's temporal kind: in progress, settled past, or future.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntervalKind {
    ActualInterval,
    CurrentInterval,
    ForecastInterval,
}

/// Which channel of an `AdvancedPrice` triple a policy should read.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForecastType {
    Predicted,
    Low,
    High,
}

impl Default for ForecastType {
    fn default() -> Self {
        ForecastType::Predicted
    }
}

/// Optional `{predicted, low, high}` forecast triple, in cents/kWh.
///
/// Populated for `ForecastInterval` and the opening minutes of
/// `CurrentInterval`; absent for far-future forecasts.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AdvancedPrice {
    pub predicted: f64,
    pub low: f64,
    pub high: f64,
}

impl AdvancedPrice {
    pub fn get(&self, kind: ForecastType) -> f64 {
        match kind {
            ForecastType::Predicted => self.predicted,
            ForecastType::Low => self.low,
            ForecastType::High => self.high,
        }
    }
}

/// One half-hour or five-minute market sample.
///
/// `feedIn` prices are negated on ingest (see [`PriceInterval::ingest`]) so
/// that downstream code uniformly treats "positive" as a credit to the site.
#[cfg_attr(feature = "swagger", derive(utoipa::ToSchema))]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceInterval {
    /// Absolute end-of-interval timestamp with offset.
    pub nem_time: DateTime<FixedOffset>,
    /// Interval length in minutes (5 or 30).
    pub duration_minutes: i64,
    pub channel_type: ChannelType,
    pub kind: IntervalKind,
    /// Cents per kWh, already sign-normalized (see struct docs).
    pub per_kwh: f64,
    pub advanced_price: Option<AdvancedPrice>,
}

impl PriceInterval {
    /// Builds an interval from raw upstream fields, applying the feed-in
    /// sign-normalization invariant. `raw_per_kwh` and `raw_advanced_price`
    /// are in the upstream's native sign convention (feed-in negative when
    /// the consumer is paid).
    pub fn ingest(
        nem_time: DateTime<FixedOffset>,
        duration_minutes: i64,
        channel_type: ChannelType,
        kind: IntervalKind,
        raw_per_kwh: f64,
        raw_advanced_price: Option<AdvancedPrice>,
    ) -> Self {
        let negate = matches!(channel_type, ChannelType::FeedIn);
        let per_kwh = if negate { -raw_per_kwh } else { raw_per_kwh };
        let advanced_price = raw_advanced_price.map(|a| {
            if negate {
                AdvancedPrice {
                    predicted: -a.predicted,
                    low: -a.low,
                    high: -a.high,
                }
            } else {
                a
            }
        });
        Self {
            nem_time,
            duration_minutes,
            channel_type,
            kind,
            per_kwh,
            advanced_price,
        }
    }

    /// Start of the interval: the upstream timestamps the *end*.
    pub fn start_time(&self) -> DateTime<FixedOffset> {
        self.nem_time - chrono::Duration::minutes(self.duration_minutes)
    }
}

/// One of the 48 fixed half-hour slots of a civil day.
///
/// Stored as `(hour, half) with half ∈ {0, 30}`, equivalent to the wire
/// key `PERIOD_HH_MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PricePeriodKey {
    pub hour: u8,
    pub minute: u8,
}

impl PricePeriodKey {
    pub fn new(hour: u8, minute: u8) -> Self {
        debug_assert!(hour < 24);
        debug_assert!(minute == 0 || minute == 30);
        Self { hour, minute }
    }

    /// Bucket containing a given local (hour, minute) pair.
    pub fn containing(hour: u32, minute: u32) -> Self {
        Self::new(hour as u8, if minute < 30 { 0 } else { 30 })
    }

    /// Every bucket of the day, in order `PERIOD_00_00 .. PERIOD_23_30`.
    pub fn all() -> impl Iterator<Item = PricePeriodKey> {
        (0u8..24).flat_map(|h| [PricePeriodKey::new(h, 0), PricePeriodKey::new(h, 30)])
    }

    pub fn wire_key(&self) -> String {
        format!("PERIOD_{:02}_{:02}", self.hour, self.minute)
    }

    /// The bucket immediately following this one, wrapping at midnight.
    pub fn next(&self) -> Self {
        if self.minute == 0 {
            Self::new(self.hour, 30)
        } else if self.hour == 23 {
            Self::new(0, 0)
        } else {
            Self::new(self.hour + 1, 0)
        }
    }
}

impl fmt::Display for PricePeriodKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.wire_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feed_in_is_negated_on_ingest() {
        let now = chrono::Utc::now().fixed_offset();
        let i = PriceInterval::ingest(
            now,
            5,
            ChannelType::FeedIn,
            IntervalKind::CurrentInterval,
            -10.44,
            None,
        );
        assert_eq!(i.per_kwh, 10.44);

        let i = PriceInterval::ingest(
            now,
            5,
            ChannelType::General,
            IntervalKind::CurrentInterval,
            36.19,
            None,
        );
        assert_eq!(i.per_kwh, 36.19);
    }

    #[test]
    fn all_yields_48_ordered_buckets() {
        let buckets: Vec<_> = PricePeriodKey::all().collect();
        assert_eq!(buckets.len(), 48);
        assert_eq!(buckets[0], PricePeriodKey::new(0, 0));
        assert_eq!(buckets[47], PricePeriodKey::new(23, 30));
        assert!(buckets.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn next_wraps_at_midnight() {
        assert_eq!(PricePeriodKey::new(23, 30).next(), PricePeriodKey::new(0, 0));
        assert_eq!(PricePeriodKey::new(14, 0).next(), PricePeriodKey::new(14, 30));
    }

    #[test]
    fn start_time_subtracts_duration() {
        let end: DateTime<FixedOffset> = "2024-01-01T15:10:00+10:00".parse().unwrap();
        let i = PriceInterval::ingest(end, 5, ChannelType::General, IntervalKind::ActualInterval, 1.0, None);
        assert_eq!(i.start_time(), "2024-01-01T15:05:00+10:00".parse::<DateTime<FixedOffset>>().unwrap());
    }
}
