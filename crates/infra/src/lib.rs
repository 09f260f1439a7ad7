//! Infrastructure layer: job store backends, worker pool, schedulers,
//! notifier transports and configuration.

pub mod config;
pub mod event_bus;
pub mod jobs;

#[cfg(test)]
mod integration_tests;

pub use config::EngineConfig;
