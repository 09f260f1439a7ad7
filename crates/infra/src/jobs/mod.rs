//! The job engine.
//!
//! ## Components
//!
//! - [`JobStore`]: durable records plus the claim/lease protocol
//!   (in-memory, or Postgres advisory locks)
//! - [`Capsule`]: worker threads draining the store, woken by polling or by
//!   notifications
//! - [`Adapter`]: submission and execution-mode dispatch
//! - [`CronManager`]: recurring schedules enqueued through the adapter
//! - [`CleanupTracker`]: when to sweep finished records
//! - [`PauseRegistry`]: queues, job classes and labels workers must skip
//! - [`Lifecycle`]: coordinated start/stop of everything above

pub mod adapter;
pub mod capsule;
pub mod cleanup;
pub mod cron;
pub mod engine;
pub mod executor;
pub mod lifecycle;
pub mod observer;
pub mod pause;
pub mod postgres;
pub mod queues;
pub mod registry;
pub mod store;
pub mod types;

pub use adapter::{Adapter, AdapterError, ExecutionMode, JobSubmitter, ProcessRole};
pub use capsule::{Capsule, CapsuleConfig};
pub use cleanup::{CleanupOptions, CleanupTracker, cleanup_preserved_jobs};
pub use cron::{CronEntry, CronEntryConfig, CronManager};
pub use engine::{Engine, EngineBuilder};
pub use executor::{ExecuteError, JobExecutor};
pub use lifecycle::{Lifecycle, Managed};
pub use observer::{ErrorObserver, ErrorSource, JobContext, log_errors};
pub use pause::{InMemoryPauseStore, PauseRegistry, PauseStore, PauseTarget, PausedSnapshot};
pub use postgres::PostgresJobStore;
pub use queues::{QueueGroup, QueueSelector};
pub use registry::{JobHandler, JobRegistry};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{
    ClaimQuery, ClaimedJob, DEFAULT_QUEUE, JobError, JobRecord, JobState, Lease, NewJob,
    PriorityOrder,
};
