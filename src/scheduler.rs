//! C9: cron-fallback invoker for C5/C6/C7/C8 when no push event drives
//! them. Adapted from the teacher's `controller::scheduler::TaskScheduler`
//! — one `tokio::time::interval` loop per job with a `TaskStatus` counter —
//! generalized to a list of named jobs instead of a fixed set of methods,
//! and made single-flight per job (§2: "missed rather than queued if the
//! prior run is still executing") via a `try_lock` guard.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, Duration};
use tracing::{error, info, warn};

/// One periodic unit of work driven by the scheduler. Implementations wrap
/// the C5/C6/C7/C8 controllers together with however they source their
/// per-user list and current price samples.
#[async_trait]
pub trait SchedulerJob: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self) -> anyhow::Result<()>;
}

/// Run-count/error bookkeeping surfaced to the administrative status
/// endpoint, mirroring the teacher's `TaskStatus`.
#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_overlap_count: u64,
}

struct JobSlot {
    job: Arc<dyn SchedulerJob>,
    interval_secs: u64,
    running: Mutex<()>,
    status: RwLock<TaskStatus>,
}

pub struct Scheduler {
    jobs: Vec<Arc<JobSlot>>,
}

impl Scheduler {
    /// `jobs` pairs each job with its own interval in seconds — callers
    /// read these out of `SchedulerConfig`'s per-job fields when wiring
    /// the C5/C6/C7/C8 controllers into concrete `SchedulerJob` impls.
    pub fn new(jobs: Vec<(Arc<dyn SchedulerJob>, u64)>) -> Self {
        Self {
            jobs: jobs
                .into_iter()
                .map(|(job, interval_secs)| Arc::new(JobSlot { job, interval_secs, running: Mutex::new(()), status: RwLock::new(TaskStatus::default()) }))
                .collect(),
        }
    }

    /// Spawns each job's loop; returns immediately, the loops run for the
    /// lifetime of the returned handles' tasks.
    pub fn start(self: Arc<Self>) {
        for slot in &self.jobs {
            let slot = slot.clone();
            tokio::spawn(async move {
                Self::run_job_loop(slot).await;
            });
        }
        info!(job_count = self.jobs.len(), "scheduler started");
    }

    async fn run_job_loop(slot: Arc<JobSlot>) {
        let mut ticker = interval(Duration::from_secs(slot.interval_secs.max(1)));
        loop {
            ticker.tick().await;

            let Ok(_guard) = slot.running.try_lock() else {
                let mut status = slot.status.write().await;
                status.skipped_overlap_count += 1;
                warn!(job = slot.job.name(), "previous run still in progress, skipping this tick");
                continue;
            };

            let now = Utc::now();
            {
                let mut status = slot.status.write().await;
                status.last_run = Some(now);
                status.run_count += 1;
            }

            match slot.job.run().await {
                Ok(()) => {
                    let mut status = slot.status.write().await;
                    status.last_success = Some(now);
                    status.success_count += 1;
                    status.last_error = None;
                }
                Err(e) => {
                    error!(job = slot.job.name(), error = %e, "scheduled job failed");
                    let mut status = slot.status.write().await;
                    status.error_count += 1;
                    status.last_error = Some(e.to_string());
                }
            }
        }
    }

    pub async fn status_for(&self, name: &str) -> Option<TaskStatus> {
        for slot in &self.jobs {
            if slot.job.name() == name {
                return Some(slot.status.read().await.clone());
            }
        }
        None
    }
}
