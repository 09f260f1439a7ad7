//! Runs one claimed record to its terminal state.

use std::sync::Arc;

use tracing::{debug, error, info_span, warn};

use super::observer::{ErrorObserver, ErrorSource, JobContext, log_errors};
use super::registry::JobRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimedJob, JobError, Lease};

/// Why [`JobExecutor::execute`] did not complete a body successfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    /// The body never ran: the store refused to start it.
    #[error(transparent)]
    Store(#[from] JobStoreError),
    /// The body ran and failed.
    #[error(transparent)]
    Job(#[from] JobError),
}

/// Executes claimed jobs: mark performing, run the body, record the outcome,
/// release the lease. Shared by worker threads and inline execution.
#[derive(Clone)]
pub struct JobExecutor {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    observer: ErrorObserver,
}

impl JobExecutor {
    pub fn new(store: Arc<dyn JobStore>, registry: Arc<JobRegistry>) -> Self {
        Self {
            store,
            registry,
            observer: log_errors(),
        }
    }

    pub fn with_observer(mut self, observer: ErrorObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub fn observer(&self) -> &ErrorObserver {
        &self.observer
    }

    /// Execute under the held lease and always release it afterwards.
    ///
    /// The body's failure is recorded on the record, reported to the observer
    /// and returned. If the record cannot be marked performing the body is
    /// skipped and that store error is returned. Store failures after the body
    /// ran are logged only.
    pub fn execute(&self, claimed: ClaimedJob, source: ErrorSource) -> Result<(), ExecuteError> {
        let ClaimedJob { lease, record } = claimed;
        let span = info_span!(
            "job",
            job_id = %record.id,
            queue = %record.queue_name,
            job_class = %record.job_class,
        );
        let _enter = span.enter();

        if let Err(err) = self.store.mark_performing(&lease) {
            warn!(error = %err, "could not mark job performing, releasing");
            self.release(&lease);
            return Err(err.into());
        }

        debug!("performing job");
        let result = self.registry.perform(&record);

        let error_text = result.as_ref().err().map(ToString::to_string);
        if let Err(err) = &result {
            (self.observer)(err, &JobContext::for_record(source, &record));
        }

        match self.store.mark_finished(&lease, error_text.as_deref()) {
            Ok(()) => debug!(succeeded = result.is_ok(), "job finished"),
            Err(err) => error!(error = %err, "failed to record job outcome"),
        }
        self.release(&lease);

        result.map_err(ExecuteError::Job)
    }

    fn release(&self, lease: &Lease) {
        if let Err(err) = self.store.release(lease) {
            error!(job_id = %lease.job_id, error = %err, "failed to release lease");
        }
    }
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}
