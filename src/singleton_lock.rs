//! Process-wide singleton election (§5/§9): in a multi-worker deployment,
//! exactly one worker owns the scheduler (C9) and at most one owns the
//! push price client (C1). Workers that lose the race skip the
//! corresponding subsystem rather than erroring — the others keep serving
//! the administrative surface.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use fs4::fs_std::FileExt;
use rand::Rng;
use tracing::{info, warn};

use crate::config::LockConfig;

const SCHEDULER_LOCK_FILE: &str = "scheduler.lock";
const WEBSOCKET_LOCK_FILE: &str = "websocket.lock";

/// Holds an acquired advisory lock for the process lifetime; dropping it
/// releases the lock, letting another worker win it on the next restart.
pub struct SingletonLock {
    file: File,
    path: PathBuf,
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to release singleton lock");
        }
    }
}

/// Sleeps a uniform random 100-500ms before any lock attempt, so a fleet
/// of workers restarting together don't all race the same `try_lock` in
/// the same instant.
pub async fn startup_stagger(config: &LockConfig) {
    let wait_ms = {
        let mut rng = rand::thread_rng();
        rng.gen_range(config_stagger_range(config))
    };
    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
}

fn config_stagger_range(_config: &LockConfig) -> std::ops::Range<u64> {
    100..500
}

/// Attempts to become the sole owner of the scheduler (C9). Returns `None`
/// if another worker already holds the lock.
pub fn try_acquire_scheduler_lock(config: &LockConfig) -> Option<SingletonLock> {
    try_acquire(&config.lock_dir, SCHEDULER_LOCK_FILE, "scheduler")
}

/// Attempts to become the sole owner of the push price client (C1).
pub fn try_acquire_websocket_lock(config: &LockConfig) -> Option<SingletonLock> {
    try_acquire(&config.lock_dir, WEBSOCKET_LOCK_FILE, "websocket")
}

fn try_acquire(lock_dir: &Path, file_name: &str, subsystem: &str) -> Option<SingletonLock> {
    if let Err(e) = std::fs::create_dir_all(lock_dir) {
        warn!(dir = %lock_dir.display(), error = %e, "could not create lock directory, skipping subsystem");
        return None;
    }
    let path = lock_dir.join(file_name);
    let file = match OpenOptions::new().create(true).write(true).open(&path) {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "could not open lock file, skipping subsystem");
            return None;
        }
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            info!(subsystem, path = %path.display(), "acquired singleton lock");
            Some(SingletonLock { file, path })
        }
        Err(_) => {
            info!(subsystem, path = %path.display(), "another worker already owns this subsystem, skipping");
            None
        }
    }
}
