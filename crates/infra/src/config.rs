//! Engine configuration, loadable from `LOCKSTEP_*` environment variables.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use lockstep_core::{ConfigError, ConfigResult};

use crate::jobs::adapter::ExecutionMode;
use crate::jobs::capsule::CapsuleConfig;
use crate::jobs::cleanup::{CleanupOptions, CleanupTracker};
use crate::jobs::cron::{CronEntry, CronEntryConfig, entries_from_config};
use crate::jobs::queues::QueueGroup;
use crate::jobs::types::PriorityOrder;

pub const DEFAULT_MAX_THREADS: usize = 5;
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
pub const DEFAULT_ASYNC_POLL_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_CLEANUP_INTERVAL_JOBS: u64 = 1_000;
pub const DEFAULT_CLEANUP_INTERVAL_SECONDS: u64 = 600;
pub const DEFAULT_PRESERVED_JOBS_SECONDS: u64 = 14 * 24 * 3600;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub execution_mode: ExecutionMode,
    /// Queue selector string, e.g. `*`, `a,b`, `-c` or `a:2;b:1`.
    pub queues: String,
    pub max_threads: usize,
    /// Seconds; `None` picks the mode's default.
    pub poll_interval: Option<u64>,
    pub smaller_number_is_higher_priority: bool,
    /// `None` disables the count threshold.
    pub cleanup_interval_jobs: Option<u64>,
    /// `None` disables the time threshold.
    pub cleanup_interval_seconds: Option<u64>,
    pub cleanup_discarded_jobs: bool,
    pub cleanup_preserved_jobs_before_seconds_ago: u64,
    pub enable_cron: bool,
    pub cron: BTreeMap<String, CronEntryConfig>,
    /// Seconds of missed cron firings to replay on start.
    pub cron_graceful_restart_period: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::External,
            queues: "*".to_string(),
            max_threads: DEFAULT_MAX_THREADS,
            poll_interval: None,
            smaller_number_is_higher_priority: true,
            cleanup_interval_jobs: Some(DEFAULT_CLEANUP_INTERVAL_JOBS),
            cleanup_interval_seconds: Some(DEFAULT_CLEANUP_INTERVAL_SECONDS),
            cleanup_discarded_jobs: true,
            cleanup_preserved_jobs_before_seconds_ago: DEFAULT_PRESERVED_JOBS_SECONDS,
            enable_cron: false,
            cron: BTreeMap::new(),
            cron_graceful_restart_period: None,
        }
    }
}

impl EngineConfig {
    /// Read `LOCKSTEP_*` variables from the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; unset keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("LOCKSTEP_EXECUTION_MODE") {
            config.execution_mode = v.parse()?;
        }
        if let Some(v) = get("LOCKSTEP_QUEUES") {
            config.queues = v;
        }
        if let Some(v) = get("LOCKSTEP_MAX_THREADS") {
            config.max_threads = parse_number("LOCKSTEP_MAX_THREADS", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_POLL_INTERVAL") {
            config.poll_interval = Some(parse_number("LOCKSTEP_POLL_INTERVAL", &v)?);
        }
        if let Some(v) = get("LOCKSTEP_SMALLER_NUMBER_IS_HIGHER_PRIORITY") {
            config.smaller_number_is_higher_priority =
                parse_bool("LOCKSTEP_SMALLER_NUMBER_IS_HIGHER_PRIORITY", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_CLEANUP_INTERVAL_JOBS") {
            config.cleanup_interval_jobs = parse_threshold("LOCKSTEP_CLEANUP_INTERVAL_JOBS", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_CLEANUP_INTERVAL_SECONDS") {
            config.cleanup_interval_seconds =
                parse_threshold("LOCKSTEP_CLEANUP_INTERVAL_SECONDS", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_CLEANUP_DISCARDED_JOBS") {
            config.cleanup_discarded_jobs = parse_bool("LOCKSTEP_CLEANUP_DISCARDED_JOBS", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_CLEANUP_PRESERVED_JOBS_BEFORE_SECONDS_AGO") {
            config.cleanup_preserved_jobs_before_seconds_ago =
                parse_number("LOCKSTEP_CLEANUP_PRESERVED_JOBS_BEFORE_SECONDS_AGO", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_ENABLE_CRON") {
            config.enable_cron = parse_bool("LOCKSTEP_ENABLE_CRON", &v)?;
        }
        if let Some(v) = get("LOCKSTEP_CRON") {
            config.cron = serde_json::from_str(&v)
                .map_err(|e| ConfigError::invalid_value("LOCKSTEP_CRON", e.to_string()))?;
        }
        if let Some(v) = get("LOCKSTEP_CRON_GRACEFUL_RESTART_PERIOD") {
            config.cron_graceful_restart_period =
                Some(parse_number("LOCKSTEP_CRON_GRACEFUL_RESTART_PERIOD", &v)?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Fail fast on anything that would otherwise only fail at start.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_threads == 0 {
            return Err(ConfigError::invalid_value("max_threads", "must be at least 1"));
        }
        if self.poll_interval == Some(0) {
            return Err(ConfigError::invalid_value("poll_interval", "must be at least 1 second"));
        }
        self.queue_groups()?;
        self.cleanup_tracker()?;
        self.cron_entries()?;
        Ok(())
    }

    pub fn queue_groups(&self) -> ConfigResult<Vec<QueueGroup>> {
        QueueGroup::parse_many(&self.queues)
    }

    pub fn priority_order(&self) -> PriorityOrder {
        if self.smaller_number_is_higher_priority {
            PriorityOrder::SmallerFirst
        } else {
            PriorityOrder::LargerFirst
        }
    }

    pub fn poll_interval(&self) -> Duration {
        let secs = self.poll_interval.unwrap_or(match self.execution_mode {
            ExecutionMode::Async | ExecutionMode::AsyncServer | ExecutionMode::AsyncAll => {
                DEFAULT_ASYNC_POLL_INTERVAL_SECS
            }
            ExecutionMode::Inline | ExecutionMode::External => DEFAULT_POLL_INTERVAL_SECS,
        });
        Duration::from_secs(secs)
    }

    pub fn cleanup_tracker(&self) -> ConfigResult<CleanupTracker> {
        CleanupTracker::new(self.cleanup_interval_seconds, self.cleanup_interval_jobs)
    }

    pub fn cleanup_options(&self) -> CleanupOptions {
        CleanupOptions {
            older_than: chrono::Duration::seconds(
                i64::try_from(self.cleanup_preserved_jobs_before_seconds_ago).unwrap_or(i64::MAX),
            ),
            include_discarded: self.cleanup_discarded_jobs,
            ..CleanupOptions::default()
        }
    }

    pub fn capsule_config(&self) -> ConfigResult<CapsuleConfig> {
        self.validate()?;
        Ok(CapsuleConfig {
            queues: self.queue_groups()?,
            max_threads: self.max_threads,
            poll_interval: self.poll_interval(),
            priority_order: self.priority_order(),
            lower_thread_priority: self.execution_mode == ExecutionMode::AsyncAll,
            cleanup: self.cleanup_options(),
        })
    }

    pub fn cron_entries(&self) -> ConfigResult<Vec<CronEntry>> {
        entries_from_config(&self.cron)
    }

    pub fn cron_graceful_restart_period(&self) -> Option<chrono::Duration> {
        self.cron_graceful_restart_period
            .and_then(|secs| i64::try_from(secs).ok())
            .map(chrono::Duration::seconds)
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> ConfigResult<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e: T::Err| ConfigError::invalid_value(name, e.to_string()))
}

fn parse_bool(name: &'static str, value: &str) -> ConfigResult<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => Err(ConfigError::invalid_value(name, format!("not a boolean: {other:?}"))),
    }
}

/// `false` disables; a number (including a rejected `0`) is kept as given.
fn parse_threshold(name: &'static str, value: &str) -> ConfigResult<Option<u64>> {
    if value.eq_ignore_ascii_case("false") {
        return Ok(None);
    }
    parse_number(name, value).map(Some)
}
