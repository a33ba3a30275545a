//! C4: arbitrates between the event-driven push feed and the cron-style
//! pull fallback so only one sync happens per 5-minute settlement period,
//! whichever producer gets there first.

use std::sync::Arc;

use chrono::{DateTime, Timelike, Utc};
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};
use tracing::{info, warn};

/// One 5-minute settlement period, identified by its truncated start time.
fn current_period(now: DateTime<Utc>) -> DateTime<Utc> {
    let minute = now.minute() - (now.minute() % 5);
    now.with_minute(minute).unwrap().with_second(0).unwrap().with_nanosecond(0).unwrap()
}

/// Shared coordination point between the push producer's reconnect loop and
/// the scheduled sync job. Exactly one `claim_period` call per period
/// returns `true`; every later caller in the same period is told it was
/// already handled.
pub struct SyncCoordinator {
    notify: Notify,
    claimed_period: Mutex<Option<DateTime<Utc>>>,
}

impl Default for SyncCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self { notify: Notify::new(), claimed_period: Mutex::new(None) }
    }

    /// Called from the push producer's message handler whenever a fresh
    /// price lands; wakes at most one waiter in `wait_for_push_or_timeout`.
    pub fn notify_push_update(&self) {
        info!("price update received, notifying sync coordinator");
        self.notify.notify_one();
    }

    /// Blocks the caller until a push update arrives or `timeout_secs`
    /// elapses, whichever is first.
    pub async fn wait_for_push_or_timeout(&self, timeout_secs: u64) -> bool {
        info!(timeout_secs, "waiting for a push price update before falling back to REST");
        match timeout(Duration::from_secs(timeout_secs), self.notify.notified()).await {
            Ok(()) => {
                info!("push update arrived, using it for this period's sync");
                true
            }
            Err(_) => {
                warn!(timeout_secs, "push update timed out, falling back to REST poll");
                false
            }
        }
    }

    /// Attempts to claim the current period for sync. Returns `true` only
    /// for the first caller in a given period; later callers (either
    /// producer racing the other) get `false`.
    pub async fn claim_period(&self) -> bool {
        let period = current_period(Utc::now());
        let mut claimed = self.claimed_period.lock().await;
        if *claimed == Some(period) {
            return false;
        }
        *claimed = Some(period);
        true
    }

    /// Read-only check: has this period already been claimed by someone?
    pub async fn is_period_claimed(&self) -> bool {
        let period = current_period(Utc::now());
        *self.claimed_period.lock().await == Some(period)
    }
}

pub type SharedSyncCoordinator = Arc<SyncCoordinator>;
