// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Retention sweeper for expired counters.
//!
//! A counter not written for the retention horizon (24 hours by default)
//! no longer influences any rule and is deleted. Each key is handled under
//! its own store lock with a short timeout; busy keys are left for the
//! next sweep so a sweep never stalls a decision.
//!
//! Separate processes sweeping one state directory serialise on
//! [`try_sweep_lock`]; a sweep that finds the lock held has nothing to add.

use crate::metrics::Metrics;
use crate::store::{CounterStore, StoreError};
use serde::Serialize;
use std::fs::{File, OpenOptions, TryLockError};
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock file in the state directory held for the length of a sweep.
pub const SWEEP_LOCK_FILE: &str = "sweep.lock";

/// Take the state directory's sweep lock without waiting.
///
/// Returns `None` when another sweep holds it. The lock is released when
/// the returned file is dropped.
pub fn try_sweep_lock(state_dir: &Path) -> io::Result<Option<File>> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(state_dir.join(SWEEP_LOCK_FILE))?;
    match file.try_lock() {
        Ok(()) => Ok(Some(file)),
        Err(TryLockError::WouldBlock) => Ok(None),
        Err(TryLockError::Error(e)) => Err(e),
    }
}

/// Summary of one sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Records examined
    pub scanned: usize,
    /// Records deleted
    pub removed: usize,
    /// Expired records skipped because their key was busy
    pub skipped_busy: usize,
    /// Records that could not be removed
    pub failed: usize,
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "scanned={} removed={} skipped_busy={} failed={}",
            self.scanned, self.removed, self.skipped_busy, self.failed
        )
    }
}

/// Deletes counters older than the retention horizon.
pub struct RetentionSweeper<S> {
    store: Arc<S>,
    retention_secs: i64,
    lock_timeout: Duration,
    metrics: Option<Metrics>,
}

impl<S: CounterStore> RetentionSweeper<S> {
    pub fn new(store: Arc<S>, retention_secs: i64) -> Self {
        Self {
            store,
            retention_secs,
            lock_timeout: Duration::from_millis(50),
            metrics: None,
        }
    }

    /// How long to wait for a busy key before skipping it.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn is_expired(&self, now: i64, modified_at: i64) -> bool {
        now.saturating_sub(modified_at) >= self.retention_secs
    }

    /// Delete every record last modified at least the retention horizon
    /// before `now`.
    pub async fn sweep(&self, now: i64) -> Result<SweepReport, StoreError> {
        let mut report = SweepReport::default();

        for (key, modified_at) in self.store.entries().await? {
            report.scanned += 1;
            if !self.is_expired(now, modified_at) {
                continue;
            }

            let guard = match self
                .store
                .lock(std::slice::from_ref(&key), self.lock_timeout)
                .await
            {
                Ok(guard) => guard,
                Err(StoreError::LockTimeout(_)) => {
                    report.skipped_busy += 1;
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "Sweep could not lock key");
                    report.failed += 1;
                    continue;
                }
            };

            // A decision may have refreshed the key while we waited.
            match self.store.last_modified(&key).await {
                Ok(Some(current)) if self.is_expired(now, current) => {}
                Ok(_) => continue,
                Err(e) => {
                    warn!(%key, error = %e, "Sweep could not stat key");
                    report.failed += 1;
                    continue;
                }
            }

            match self.store.delete_locked(&guard, &key).await {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    warn!(%key, error = %e, "Sweep could not delete key");
                    report.failed += 1;
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.observe_sweep(&report);
        }
        debug!(%report, "Retention sweep finished");
        Ok(report)
    }
}
