//! `lockstep-core`: identifiers and configuration errors shared by every layer.
//!
//! This crate has no IO. The job store, worker pool and schedulers live in
//! `lockstep-infra`; the change-notification mechanics live in `lockstep-events`.

pub mod error;
pub mod id;

pub use error::{ConfigError, ConfigResult};
pub use id::{JobId, LeaseToken, ProcessId};
