//! Core job types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use lockstep_core::{JobId, LeaseToken, ProcessId};

use super::queues::QueueSelector;

/// Queue used when a job does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// A job as handed to the submission adapter.
///
/// `provider_job_id` is filled in by the adapter once the record has been
/// persisted; it stays `None` for jobs the store refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_class: String,
    /// Serialized arguments. Opaque to the engine.
    pub arguments: JsonValue,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub labels: Vec<String>,
    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,
    pub provider_job_id: Option<JobId>,
}

impl NewJob {
    pub fn new(job_class: impl Into<String>, arguments: JsonValue) -> Self {
        Self {
            job_class: job_class.into(),
            arguments,
            queue_name: DEFAULT_QUEUE.to_string(),
            priority: 0,
            scheduled_at: None,
            labels: Vec::new(),
            cron_key: None,
            cron_at: None,
            provider_job_id: None,
        }
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    /// Tag the job as the `cron_at` firing of cron entry `key`.
    pub fn from_cron(mut self, key: impl Into<String>, cron_at: DateTime<Utc>) -> Self {
        self.cron_key = Some(key.into());
        self.cron_at = Some(cron_at);
        self
    }

    /// True when the job may run at `now` (no schedule, or schedule reached).
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    /// Build the record to persist under a freshly minted identity.
    pub fn to_record(&self, now: DateTime<Utc>) -> JobRecord {
        JobRecord {
            id: JobId::new(),
            job_class: self.job_class.clone(),
            arguments: self.arguments.clone(),
            queue_name: self.queue_name.clone(),
            priority: self.priority,
            labels: self.labels.clone(),
            scheduled_at: self.scheduled_at,
            created_at: now,
            performed_at: None,
            finished_at: None,
            error: None,
            executions_count: 0,
            locked_by: None,
            cron_key: self.cron_key.clone(),
            cron_at: self.cron_at,
        }
    }
}

/// Durable unit of work.
///
/// `finished_at` is set exactly once, when the record reaches a terminal
/// state (succeeded, or discarded with `error`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_class: String,
    pub arguments: JsonValue,
    pub queue_name: String,
    pub priority: i32,
    pub labels: Vec<String>,
    /// Earliest eligible execution time; `None` means as soon as possible.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub performed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub executions_count: u32,
    /// Process currently holding the record's lease, if any.
    pub locked_by: Option<ProcessId>,
    pub cron_key: Option<String>,
    pub cron_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// The instant the record becomes eligible, used for ordering.
    pub fn due_at(&self) -> DateTime<Utc> {
        self.scheduled_at.unwrap_or(self.created_at)
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    pub fn is_discarded(&self) -> bool {
        self.finished_at.is_some() && self.error.is_some()
    }

    /// Unfinished and due. Lock state is the store's concern.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.finished_at.is_none() && self.due_at() <= now
    }

    pub fn state(&self, now: DateTime<Utc>) -> JobState {
        match (&self.finished_at, &self.error) {
            (Some(_), None) => JobState::Succeeded,
            (Some(_), Some(_)) => JobState::Discarded,
            (None, _) if self.locked_by.is_some() => JobState::Running,
            (None, _) if self.due_at() > now => JobState::Scheduled,
            (None, _) => JobState::Queued,
        }
    }
}

/// Derived lifecycle state of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for `scheduled_at`.
    Scheduled,
    /// Due and unclaimed.
    Queued,
    /// Lease held by a worker.
    Running,
    Succeeded,
    /// Finished with an error.
    Discarded,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Discarded)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Scheduled => "scheduled",
            JobState::Queued => "queued",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Discarded => "discarded",
        };
        f.write_str(s)
    }
}

/// Exclusive ownership of one record, valid until released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lease {
    pub job_id: JobId,
    pub token: LeaseToken,
    pub owner: ProcessId,
}

/// A record together with the lease proving the caller owns it.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimedJob {
    pub lease: Lease,
    pub record: JobRecord,
}

/// Which way priority numbers sort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityOrder {
    /// `-10` runs before `0` runs before `10`.
    #[default]
    SmallerFirst,
    /// `10` runs before `0` runs before `-10`.
    LargerFirst,
}

impl PriorityOrder {
    pub fn compare(self, a: i32, b: i32) -> std::cmp::Ordering {
        match self {
            PriorityOrder::SmallerFirst => a.cmp(&b),
            PriorityOrder::LargerFirst => b.cmp(&a),
        }
    }
}

/// Parameters of one claim attempt.
#[derive(Debug, Clone)]
pub struct ClaimQuery {
    pub queues: QueueSelector,
    pub order: PriorityOrder,
    /// Records to pass over this attempt (e.g. ones just released because
    /// they were paused).
    pub skip: Vec<JobId>,
    pub now: DateTime<Utc>,
}

impl ClaimQuery {
    pub fn new(queues: QueueSelector, order: PriorityOrder) -> Self {
        Self {
            queues,
            order,
            skip: Vec::new(),
            now: Utc::now(),
        }
    }

    pub fn at(mut self, now: DateTime<Utc>) -> Self {
        self.now = now;
        self
    }

    pub fn skipping(mut self, skip: Vec<JobId>) -> Self {
        self.skip = skip;
        self
    }
}

/// Failure of a job body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// The body returned an error.
    #[error("{0}")]
    Failed(String),
    /// The body panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
    /// No handler is registered for the record's class.
    #[error("no handler for job class {0:?}")]
    UnknownJobClass(String),
}

impl JobError {
    pub fn failed(err: &anyhow::Error) -> Self {
        Self::Failed(format!("{err:#}"))
    }
}
