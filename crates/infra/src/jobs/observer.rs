//! Process-wide sink for job-body errors.

use std::sync::Arc;

use lockstep_core::JobId;

use super::types::{JobError, JobRecord};

/// Where a failing body was running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// A worker pool thread.
    Worker,
    /// The caller's thread (inline execution).
    Inline,
    /// A cron-triggered execution.
    Cron,
}

/// What was running when a body failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobContext {
    pub source: ErrorSource,
    pub job_id: Option<JobId>,
    pub job_class: String,
    pub queue_name: Option<String>,
    pub cron_key: Option<String>,
}

impl JobContext {
    pub fn for_record(source: ErrorSource, record: &JobRecord) -> Self {
        Self {
            source,
            job_id: Some(record.id),
            job_class: record.job_class.clone(),
            queue_name: Some(record.queue_name.clone()),
            cron_key: record.cron_key.clone(),
        }
    }
}

pub type ErrorObserver = Arc<dyn Fn(&JobError, &JobContext) + Send + Sync>;

/// Default observer: one `error!` line per failure.
pub fn log_errors() -> ErrorObserver {
    Arc::new(|err, ctx| {
        tracing::error!(
            source = ?ctx.source,
            job_id = ?ctx.job_id,
            job_class = %ctx.job_class,
            queue = ?ctx.queue_name,
            cron_key = ?ctx.cron_key,
            error = %err,
            "job failed"
        );
    })
}

#[cfg(test)]
pub(crate) fn collecting() -> (ErrorObserver, Arc<std::sync::Mutex<Vec<(JobError, JobContext)>>>) {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = seen.clone();
    let observer: ErrorObserver = Arc::new(move |err, ctx| {
        sink.lock().unwrap().push((err.clone(), ctx.clone()));
    });
    (observer, seen)
}
