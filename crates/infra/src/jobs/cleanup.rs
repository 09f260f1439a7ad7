//! When to sweep finished records, and the sweep itself.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use lockstep_core::{ConfigError, ConfigResult};

use super::store::{JobStore, JobStoreError};

/// Threshold gate for retention sweeps.
///
/// Each threshold is `None` when disabled. A literal zero is a configuration
/// error, distinct from disabled. With both disabled the tracker never fires.
#[derive(Debug, Clone)]
pub struct CleanupTracker {
    interval_seconds: Option<u64>,
    interval_jobs: Option<u64>,
    job_count: u64,
    last_at: DateTime<Utc>,
}

impl CleanupTracker {
    pub fn new(
        cleanup_interval_seconds: Option<u64>,
        cleanup_interval_jobs: Option<u64>,
    ) -> ConfigResult<Self> {
        if cleanup_interval_seconds == Some(0) {
            return Err(ConfigError::zero_threshold("cleanup_interval_seconds"));
        }
        if cleanup_interval_jobs == Some(0) {
            return Err(ConfigError::zero_threshold("cleanup_interval_jobs"));
        }
        Ok(Self {
            interval_seconds: cleanup_interval_seconds,
            interval_jobs: cleanup_interval_jobs,
            job_count: 0,
            last_at: Utc::now(),
        })
    }

    /// A tracker that never asks for a sweep.
    pub fn disabled() -> Self {
        Self {
            interval_seconds: None,
            interval_jobs: None,
            job_count: 0,
            last_at: Utc::now(),
        }
    }

    pub fn increment(&mut self) {
        self.job_count += 1;
    }

    pub fn cleanup(&self) -> bool {
        self.cleanup_at(Utc::now())
    }

    /// True once the count or the elapsed time exceeds its threshold.
    pub fn cleanup_at(&self, now: DateTime<Utc>) -> bool {
        let by_count = self.interval_jobs.is_some_and(|n| self.job_count > n);
        let by_time = self.interval_seconds.is_some_and(|secs| {
            let secs = i64::try_from(secs).unwrap_or(i64::MAX);
            now - self.last_at > Duration::seconds(secs)
        });
        by_count || by_time
    }

    pub fn reset(&mut self) {
        self.job_count = 0;
        self.last_at = Utc::now();
    }

    pub fn job_count(&self) -> u64 {
        self.job_count
    }

    pub fn last_at(&self) -> DateTime<Utc> {
        self.last_at
    }
}

impl Default for CleanupTracker {
    fn default() -> Self {
        Self::disabled()
    }
}

/// Parameters of one retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupOptions {
    /// Records finished more recently than this are kept.
    pub older_than: Duration,
    pub in_batches_of: usize,
    /// Whether discarded (errored) records are swept too.
    pub include_discarded: bool,
}

impl Default for CleanupOptions {
    fn default() -> Self {
        Self {
            older_than: Duration::days(14),
            in_batches_of: 1_000,
            include_discarded: true,
        }
    }
}

/// Delete finished records older than the cutoff, batch by batch, until a
/// batch comes back short. Returns the total deleted.
pub fn cleanup_preserved_jobs<S>(store: &S, options: CleanupOptions) -> Result<usize, JobStoreError>
where
    S: JobStore + ?Sized,
{
    let cutoff = Utc::now() - options.older_than;
    let batch = options.in_batches_of.max(1);
    let mut total = 0;

    loop {
        let deleted = store.delete_finished(cutoff, options.include_discarded, batch)?;
        total += deleted;
        debug!(deleted, total, "cleanup batch");
        if deleted < batch {
            break;
        }
    }

    info!(
        deleted = total,
        %cutoff,
        include_discarded = options.include_discarded,
        "cleaned up preserved jobs"
    );
    Ok(total)
}
