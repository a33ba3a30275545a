//! Append-only history sink for price samples and energy usage snapshots
//! (§2.1's "a no-op/in-memory default, a `sqlx`-backed Postgres
//! implementation behind the `db` feature"). C9's `save_price_history`/
//! `save_energy_usage` jobs write through this trait; nothing in the core
//! reads it back, matching the teacher's write-mostly repository split.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::PriceInterval;

/// A snapshot of one site's live power flow, timestamped on write.
#[derive(Debug, Clone)]
pub struct EnergyUsageSample {
    pub site_id: String,
    pub recorded_at: DateTime<Utc>,
    pub solar_power_w: f64,
    pub battery_power_w: f64,
    pub load_power_w: f64,
    pub grid_power_w: f64,
}

#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn save_price_samples(&self, site_id: &str, samples: &[PriceInterval]) -> anyhow::Result<()>;
    async fn save_energy_usage(&self, sample: &EnergyUsageSample) -> anyhow::Result<()>;
}

/// Default sink for deployments without the `db` feature: history is
/// simply not retained. C9's jobs still run and log, they just have
/// nowhere durable to write.
pub struct NoopHistorySink;

#[async_trait]
impl HistorySink for NoopHistorySink {
    async fn save_price_samples(&self, _site_id: &str, _samples: &[PriceInterval]) -> anyhow::Result<()> {
        Ok(())
    }

    async fn save_energy_usage(&self, _sample: &EnergyUsageSample) -> anyhow::Result<()> {
        Ok(())
    }
}

#[cfg(feature = "db")]
pub struct PostgresHistorySink {
    pool: sqlx::PgPool,
}

#[cfg(feature = "db")]
impl PostgresHistorySink {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

#[cfg(feature = "db")]
#[async_trait]
impl HistorySink for PostgresHistorySink {
    async fn save_price_samples(&self, site_id: &str, samples: &[PriceInterval]) -> anyhow::Result<()> {
        use anyhow::Context;

        for sample in samples {
            sqlx::query!(
                r#"
                INSERT INTO price_history (site_id, nem_time, duration_minutes, channel_type, kind, per_kwh)
                VALUES ($1, $2, $3, $4, $5, $6)
                ON CONFLICT (site_id, nem_time, channel_type, duration_minutes) DO NOTHING
                "#,
                site_id,
                sample.nem_time,
                sample.duration_minutes as i32,
                format!("{:?}", sample.channel_type),
                format!("{:?}", sample.kind),
                sample.per_kwh,
            )
            .execute(&self.pool)
            .await
            .context("inserting price history sample")?;
        }
        Ok(())
    }

    async fn save_energy_usage(&self, sample: &EnergyUsageSample) -> anyhow::Result<()> {
        use anyhow::Context;

        sqlx::query!(
            r#"
            INSERT INTO energy_usage_history
                (site_id, recorded_at, solar_power_w, battery_power_w, load_power_w, grid_power_w)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
            sample.site_id,
            sample.recorded_at,
            sample.solar_power_w,
            sample.battery_power_w,
            sample.load_power_w,
            sample.grid_power_w,
        )
        .execute(&self.pool)
        .await
        .context("inserting energy usage sample")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ChannelType, IntervalKind};
    use chrono::FixedOffset;

    #[tokio::test]
    async fn noop_sink_accepts_everything() {
        let sink = NoopHistorySink;
        let end: DateTime<FixedOffset> = "2024-06-10T15:05:00+10:00".parse().unwrap();
        let sample = PriceInterval::ingest(end, 5, ChannelType::General, IntervalKind::ActualInterval, 20.0, None);
        assert!(sink.save_price_samples("site", &[sample]).await.is_ok());

        let usage = EnergyUsageSample {
            site_id: "site".into(),
            recorded_at: Utc::now(),
            solar_power_w: 1000.0,
            battery_power_w: 0.0,
            load_power_w: 500.0,
            grid_power_w: -500.0,
        };
        assert!(sink.save_energy_usage(&usage).await.is_ok());
    }
}
