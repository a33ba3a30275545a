//! C5: per-user sync orchestration. The event-driven push path and the
//! cron-fallback path both collapse into [`SyncExecutor::sync_user`] —
//! mirroring `_sync_all_users_internal` receiving either pre-fetched
//! WebSocket data or `None` from its two callers.

use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::device::{resolve_device_timezone, DeviceController};
use crate::domain::{ChannelType, IntervalKind, PriceInterval, UserPolicy};
use crate::tariff_builder::{self, CurrentActualInterval};

/// What happened to one user's sync attempt this tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { tariff_hash: String },
    UnchangedSkipped { tariff_hash: String },
    NotEligible,
}

/// Picks the freshest sample per channel out of a flat list of 5-minute
/// intervals, preferring an in-progress `CurrentInterval` reading over a
/// settled `ActualInterval` one, and the most recent timestamp among
/// several actuals. Mirrors `extract_most_recent_actual_interval`: the push
/// feed's single current-interval pair and the REST fallback's full
/// 5-minute list both go through this same selection.
pub fn select_current_actual(samples: &[PriceInterval]) -> CurrentActualInterval {
    let five_min = |kind: IntervalKind| -> Vec<&PriceInterval> {
        samples.iter().filter(|i| i.duration_minutes == 5 && i.kind == kind).collect()
    };

    let current = five_min(IntervalKind::CurrentInterval);
    if !current.is_empty() {
        return pick_first_per_channel(&current);
    }

    let mut actual = five_min(IntervalKind::ActualInterval);
    actual.sort_by(|a, b| b.nem_time.cmp(&a.nem_time));
    pick_first_per_channel(&actual)
}

/// Takes the first sample seen for each channel, stopping once both
/// channels are filled — `samples` is expected pre-sorted by recency.
fn pick_first_per_channel(samples: &[&PriceInterval]) -> CurrentActualInterval {
    let mut result = CurrentActualInterval::default();
    for interval in samples {
        match interval.channel_type {
            ChannelType::General if result.general.is_none() => result.general = Some((*interval).clone()),
            ChannelType::FeedIn if result.feed_in.is_none() => result.feed_in = Some((*interval).clone()),
            _ => {}
        }
        if result.general.is_some() && result.feed_in.is_some() {
            break;
        }
    }
    result
}

/// Builds and applies a tariff for one user, deduplicating on the tariff's
/// content hash (§4.3 step 11) so an unchanged forecast never re-posts.
pub struct SyncExecutor {
    device: Arc<dyn DeviceController>,
}

impl SyncExecutor {
    pub fn new(device: Arc<dyn DeviceController>) -> Self {
        Self { device }
    }

    /// `current_samples` is the push cache's latest pair when a WebSocket
    /// update landed in time for this period, or the REST fallback's full
    /// 5-minute list otherwise; either way it's run through
    /// [`select_current_actual`] before building the tariff.
    pub async fn sync_user(
        &self,
        policy: &mut UserPolicy,
        forecast: &[PriceInterval],
        current_samples: &[PriceInterval],
        now: DateTime<Utc>,
    ) -> anyhow::Result<SyncOutcome> {
        if !policy.is_sync_eligible() {
            return Ok(SyncOutcome::NotEligible);
        }

        let device_tz = resolve_device_timezone(self.device.as_ref(), &policy.site_id).await;
        let current_actual = select_current_actual(current_samples);

        let tariff = tariff_builder::build_tariff(forecast, &current_actual, policy, device_tz, now)
            .context("building tariff document")?;
        let tariff_hash = tariff.hash();

        if policy.last_tariff_hash.as_deref() == Some(tariff_hash.as_str()) {
            info!(site_id = %policy.site_id, "tariff unchanged, skipping sync to avoid duplicate dashboard entries");
            policy.last_update_time = Some(now);
            policy.last_update_status = Some("unchanged, skipped".to_string());
            return Ok(SyncOutcome::UnchangedSkipped { tariff_hash });
        }

        self.device
            .set_tariff(&policy.site_id, &tariff)
            .await
            .context("applying tariff to device")?;

        policy.last_tariff_hash = Some(tariff_hash.clone());
        policy.last_update_time = Some(now);
        policy.last_update_status = Some("synced".to_string());
        info!(site_id = %policy.site_id, tariff_hash = %tariff_hash, "tariff synced");
        Ok(SyncOutcome::Applied { tariff_hash })
    }
}
