//! Submission adapter: persists jobs and decides where they run.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use lockstep_core::{ConfigError, JobId};
use lockstep_events::{JobNotification, NotifyBus, NullBus};

use super::capsule::Capsule;
use super::executor::{ExecuteError, JobExecutor};
use super::observer::ErrorSource;
use super::queues::QueueSelector;
use super::store::{JobStore, JobStoreError};
use super::types::{ClaimQuery, JobError, NewJob, PriorityOrder};

/// Where job bodies run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// In the caller's thread, at enqueue time.
    Inline,
    /// In a local worker pool, but only inside a server process.
    Async,
    /// Same as `Async`; kept as its own name for configuration.
    AsyncServer,
    /// In a local worker pool in every process, at lowered priority.
    AsyncAll,
    /// Never locally; a separate worker process drains the store.
    #[default]
    External,
}

impl FromStr for ExecutionMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "inline" => Ok(ExecutionMode::Inline),
            "async" => Ok(ExecutionMode::Async),
            "async_server" => Ok(ExecutionMode::AsyncServer),
            "async_all" => Ok(ExecutionMode::AsyncAll),
            "external" => Ok(ExecutionMode::External),
            other => Err(ConfigError::InvalidExecutionMode(other.to_string())),
        }
    }
}

impl std::fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionMode::Inline => "inline",
            ExecutionMode::Async => "async",
            ExecutionMode::AsyncServer => "async_server",
            ExecutionMode::AsyncAll => "async_all",
            ExecutionMode::External => "external",
        };
        f.write_str(s)
    }
}

/// What kind of process embeds the engine. Supplied by the embedder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessRole {
    /// A long-lived server (web or similar).
    Server,
    /// A command-line invocation.
    Cli,
    #[default]
    Other,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Store(#[from] JobStoreError),
    /// An inline-executed body failed.
    #[error(transparent)]
    Job(#[from] JobError),
}

impl From<ExecuteError> for AdapterError {
    fn from(err: ExecuteError) -> Self {
        match err {
            ExecuteError::Store(err) => AdapterError::Store(err),
            ExecuteError::Job(err) => AdapterError::Job(err),
        }
    }
}

impl AdapterError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, AdapterError::Store(JobStoreError::Duplicate(_)))
    }
}

/// Submission path used by the cron manager.
pub trait JobSubmitter: Send + Sync {
    /// Persist (and, inline, run) one cron-triggered job.
    fn submit(&self, job: &mut NewJob) -> Result<JobId, AdapterError>;
}

pub struct Adapter {
    mode: ExecutionMode,
    role: ProcessRole,
    executor: JobExecutor,
    bus: Arc<dyn NotifyBus>,
    capsule: Option<Arc<Capsule>>,
    priority_order: PriorityOrder,
}

impl Adapter {
    pub fn new(mode: ExecutionMode, role: ProcessRole, executor: JobExecutor) -> Self {
        Self {
            mode,
            role,
            executor,
            bus: Arc::new(NullBus),
            capsule: None,
            priority_order: PriorityOrder::default(),
        }
    }

    pub fn with_bus(mut self, bus: Arc<dyn NotifyBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Local worker pool, started on first async enqueue.
    pub fn with_capsule(mut self, capsule: Arc<Capsule>) -> Self {
        self.capsule = Some(capsule);
        self
    }

    pub fn with_priority_order(mut self, order: PriorityOrder) -> Self {
        self.priority_order = order;
        self
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn capsule(&self) -> Option<&Arc<Capsule>> {
        self.capsule.as_ref()
    }

    pub fn execute_inline(&self) -> bool {
        self.mode == ExecutionMode::Inline
    }

    /// True when this process runs jobs in its own worker pool.
    pub fn execute_async(&self) -> bool {
        match self.mode {
            ExecutionMode::AsyncAll => true,
            ExecutionMode::Async | ExecutionMode::AsyncServer => self.role == ProcessRole::Server,
            ExecutionMode::Inline | ExecutionMode::External => false,
        }
    }

    /// True when jobs are left for some other process to run.
    pub fn execute_externally(&self) -> bool {
        !self.execute_inline() && !self.execute_async()
    }

    /// Enqueue to run as soon as possible (or at `job.scheduled_at`).
    pub fn enqueue(&self, job: &mut NewJob) -> Result<JobId, AdapterError> {
        self.submit_one(job, ErrorSource::Inline)
    }

    /// Enqueue for `at`. A strictly future time is never executed inline.
    pub fn enqueue_at(&self, job: &mut NewJob, at: DateTime<Utc>) -> Result<JobId, AdapterError> {
        job.scheduled_at = Some(at);
        self.submit_one(job, ErrorSource::Inline)
    }

    fn submit_one(&self, job: &mut NewJob, source: ErrorSource) -> Result<JobId, AdapterError> {
        let now = Utc::now();
        let id = self.executor.store().insert(job.to_record(now))?;
        job.provider_job_id = Some(id);
        debug!(job_id = %id, queue = %job.queue_name, job_class = %job.job_class, "enqueued");

        if self.execute_inline() && job.is_due(now) {
            self.run_inline(id, source)?;
        } else {
            self.announce(&[JobNotification::new(
                job.queue_name.clone(),
                1,
                job.scheduled_at.unwrap_or(now),
            )]);
        }
        Ok(id)
    }

    /// Enqueue a batch. Returns how many were persisted; only those get a
    /// `provider_job_id`.
    ///
    /// Inline, due jobs then run in input order and the first failing body
    /// aborts the rest, which stay pending. One notification per queue covers
    /// every persisted job not run inline.
    pub fn enqueue_all(&self, jobs: &mut [NewJob]) -> Result<usize, AdapterError> {
        let now = Utc::now();
        let records = jobs.iter().map(|j| j.to_record(now)).collect();
        let ids = self.executor.store().insert_batch(records)?;

        let mut persisted = 0;
        let mut inline = Vec::new();
        let mut announced = Vec::new();
        for (job, id) in jobs.iter_mut().zip(ids) {
            job.provider_job_id = id;
            let Some(id) = id else {
                warn!(queue = %job.queue_name, job_class = %job.job_class, "job was not persisted");
                continue;
            };
            persisted += 1;
            if self.execute_inline() && job.is_due(now) {
                inline.push(id);
            } else {
                announced.push((job.queue_name.clone(), job.scheduled_at.unwrap_or(now)));
            }
        }

        self.announce(&JobNotification::aggregate(
            announced.iter().map(|(queue, at)| (queue.as_str(), *at)),
        ));
        for id in inline {
            self.run_inline(id, ErrorSource::Inline)?;
        }
        Ok(persisted)
    }

    /// Run due, unfinished records in the caller's thread until none remain
    /// or `limit` have run. The first failing body is returned as an error.
    pub fn perform_inline(
        &self,
        queues: &QueueSelector,
        limit: Option<usize>,
    ) -> Result<usize, AdapterError> {
        let mut performed = 0;
        while limit.is_none_or(|limit| performed < limit) {
            let query = ClaimQuery::new(queues.clone(), self.priority_order);
            let Some(claimed) = self.executor.store().claim_next(&query)? else {
                break;
            };
            performed += 1;
            self.executor.execute(claimed, ErrorSource::Inline)?;
        }
        Ok(performed)
    }

    pub fn shutdown(&self) {
        if let Some(capsule) = &self.capsule {
            capsule.shutdown();
        }
    }

    /// True when this adapter has a local worker pool and it is not running.
    /// An adapter without a pool never reports stopping.
    pub fn is_stopping(&self) -> bool {
        self.capsule.as_ref().is_some_and(|c| !c.is_running())
    }

    fn run_inline(&self, id: JobId, source: ErrorSource) -> Result<(), AdapterError> {
        match self.executor.store().acquire(id)? {
            Some(claimed) => Ok(self.executor.execute(claimed, source)?),
            // Someone else already holds it; they will run it.
            None => Ok(()),
        }
    }

    fn announce(&self, notifications: &[JobNotification]) {
        if notifications.is_empty() {
            return;
        }
        if self.execute_async() {
            if let Some(capsule) = &self.capsule {
                if let Err(err) = capsule.start() {
                    error!(error = %err, "failed to start local worker pool");
                }
                for n in notifications {
                    capsule.wake(n);
                }
            }
        }
        for n in notifications {
            if let Err(err) = self.bus.publish(n) {
                warn!(queue = %n.queue_name, error = %err, "failed to publish notification");
            }
        }
    }
}

impl JobSubmitter for Adapter {
    fn submit(&self, job: &mut NewJob) -> Result<JobId, AdapterError> {
        self.submit_one(job, ErrorSource::Cron)
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("mode", &self.mode)
            .field("role", &self.role)
            .field("capsule", &self.capsule.is_some())
            .finish()
    }
}
