//! Recurring schedules.
//!
//! Each entry gets one scheduler thread running a loop: wait for the next
//! fire time, compute and publish the one after it, then hand the firing to a
//! short-lived dispatch thread. Because the next time is armed before the
//! body runs, a body that blocks or fails never breaks the schedule.

use std::collections::BTreeMap;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use lockstep_core::{ConfigError, ConfigResult, JobId};
use lockstep_events::{Doorbell, Wake};

use super::adapter::{AdapterError, JobSubmitter};
use super::lifecycle::Managed;
use super::observer::{ErrorObserver, ErrorSource, JobContext, log_errors};
use super::types::{JobError, NewJob};

/// One entry as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CronEntryConfig {
    /// Cron expression: five fields, six with seconds, or an `@hourly` alias.
    pub cron: String,
    pub class: String,
    #[serde(default)]
    pub args: JsonValue,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

/// A named recurring schedule.
#[derive(Debug)]
pub struct CronEntry {
    key: String,
    expression: String,
    schedule: Schedule,
    config: CronEntryConfig,
    enabled: AtomicBool,
    next_at: Mutex<Option<DateTime<Utc>>>,
}

impl CronEntry {
    pub fn new(key: impl Into<String>, config: CronEntryConfig) -> ConfigResult<Self> {
        let key = key.into();
        let expression = normalize(&config.cron);
        let schedule = Schedule::from_str(&expression)
            .map_err(|e| ConfigError::invalid_cron(key.clone(), e.to_string()))?;
        Ok(Self {
            enabled: AtomicBool::new(config.enabled),
            key,
            expression,
            schedule,
            config,
            next_at: Mutex::new(None),
        })
    }

    /// Shorthand for tests and embedders building entries in code.
    pub fn parse(key: &str, cron: &str, class: &str) -> ConfigResult<Self> {
        Self::new(
            key,
            CronEntryConfig {
                cron: cron.to_string(),
                class: class.to_string(),
                args: JsonValue::Null,
                description: None,
                queue: None,
                priority: None,
                enabled: true,
            },
        )
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn schedule(&self) -> &str {
        &self.config.cron
    }

    pub fn job_class(&self) -> &str {
        &self.config.class
    }

    pub fn description(&self) -> Option<&str> {
        self.config.description.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// First fire time strictly after `previously_at` (or now).
    pub fn next_at(&self, previously_at: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
        let after = previously_at.unwrap_or_else(Utc::now);
        self.schedule.after(&after).next()
    }

    /// Fire times in `[start, end)`.
    pub fn within(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        self.schedule
            .after(&(start - Duration::seconds(1)))
            .skip_while(|at| *at < start)
            .take_while(|at| *at < end)
            .collect()
    }

    /// The job a firing at `cron_at` enqueues.
    pub fn job(&self, cron_at: DateTime<Utc>) -> NewJob {
        self.base_job().from_cron(self.key.clone(), cron_at)
    }

    fn base_job(&self) -> NewJob {
        let mut job = NewJob::new(self.config.class.clone(), self.config.args.clone());
        if let Some(queue) = &self.config.queue {
            job = job.on_queue(queue.clone());
        }
        if let Some(priority) = self.config.priority {
            job = job.with_priority(priority);
        }
        job
    }

    fn armed_at(&self) -> Option<DateTime<Utc>> {
        *self.next_at.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn arm(&self, at: Option<DateTime<Utc>>) {
        *self.next_at.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    fn expression(&self) -> &str {
        &self.expression
    }
}

/// The `cron` crate wants a seconds field; accept the common five-field form.
fn normalize(expression: &str) -> String {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') || trimmed.split_whitespace().count() != 5 {
        trimmed.to_string()
    } else {
        format!("0 {trimmed}")
    }
}

/// Parse a `{key: entry}` map into entries, sorted by key.
pub fn entries_from_config(config: &BTreeMap<String, CronEntryConfig>) -> ConfigResult<Vec<CronEntry>> {
    config
        .iter()
        .map(|(key, entry)| CronEntry::new(key.clone(), entry.clone()))
        .collect()
}

struct Shared {
    entries: Vec<Arc<CronEntry>>,
    submitter: Arc<dyn JobSubmitter>,
    observer: ErrorObserver,
    graceful_restart_period: Option<Duration>,
    doorbell: Doorbell,
}

impl Shared {
    /// Enqueue one firing on its own thread so the caller never blocks on it.
    fn dispatch(self: &Arc<Self>, entry: &Arc<CronEntry>, cron_at: DateTime<Utc>) {
        let shared = self.clone();
        let fired = entry.clone();
        let spawned = thread::Builder::new()
            .name(format!("lockstep-cron-{}", entry.key()))
            .spawn(move || shared.fire(&fired, cron_at));
        if let Err(err) = spawned {
            error!(cron_key = %entry.key(), error = %err, "failed to dispatch cron firing");
        }
    }

    fn fire(&self, entry: &CronEntry, cron_at: DateTime<Utc>) {
        if !entry.is_enabled() {
            debug!(cron_key = %entry.key(), %cron_at, "cron entry disabled, skipping");
            return;
        }
        let mut job = entry.job(cron_at);
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.submitter.submit(&mut job)));
        self.report(entry, Some(cron_at), outcome);
    }

    fn report(
        &self,
        entry: &CronEntry,
        cron_at: Option<DateTime<Utc>>,
        outcome: std::thread::Result<Result<JobId, AdapterError>>,
    ) {
        let key = entry.key();
        match outcome {
            Ok(Ok(job_id)) => debug!(cron_key = %key, ?cron_at, %job_id, "cron job enqueued"),
            Ok(Err(err)) if err.is_duplicate() => {
                debug!(cron_key = %key, ?cron_at, "cron firing already enqueued")
            }
            // The executor already reported the body's failure.
            Ok(Err(AdapterError::Job(_))) => {}
            Ok(Err(err)) => error!(cron_key = %key, ?cron_at, error = %err, "cron enqueue failed"),
            Err(payload) => {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic payload".to_string());
                let ctx = JobContext {
                    source: ErrorSource::Cron,
                    job_id: None,
                    job_class: entry.job_class().to_string(),
                    queue_name: None,
                    cron_key: Some(key.to_string()),
                };
                (self.observer)(&JobError::Panicked(message), &ctx);
            }
        }
    }

    fn run(self: &Arc<Self>, entry: &Arc<CronEntry>) {
        let mut next = entry.next_at(None);
        loop {
            entry.arm(next);
            let Some(cron_at) = next else {
                warn!(cron_key = %entry.key(), "schedule has no further fire times");
                return;
            };
            if !self.sleep_until(cron_at) {
                return;
            }
            next = entry.next_at(Some(cron_at));
            entry.arm(next);
            self.dispatch(entry, cron_at);
        }
    }

    /// False when shut down before `at`.
    fn sleep_until(&self, at: DateTime<Utc>) -> bool {
        loop {
            let now = Utc::now();
            if now >= at {
                return !self.doorbell.is_closed();
            }
            let delay = (at - now).to_std().unwrap_or(StdDuration::ZERO);
            if self.doorbell.wait(self.doorbell.ticket(), delay) == Wake::Closed {
                return false;
            }
        }
    }

    fn replay(self: &Arc<Self>, entry: &Arc<CronEntry>, period: Duration) {
        let now = Utc::now();
        for cron_at in entry.within(now - period, now) {
            debug!(cron_key = %entry.key(), %cron_at, "replaying missed cron firing");
            self.dispatch(entry, cron_at);
        }
    }
}

/// Runs every configured [`CronEntry`].
pub struct CronManager {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl CronManager {
    pub fn new(entries: Vec<CronEntry>, submitter: Arc<dyn JobSubmitter>) -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: entries.into_iter().map(Arc::new).collect(),
                submitter,
                observer: log_errors(),
                graceful_restart_period: None,
                doorbell: Doorbell::new(),
            }),
            threads: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        }
    }

    /// Replay firings missed within `period` on every start.
    pub fn with_graceful_restart_period(mut self, period: Duration) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.graceful_restart_period = Some(period);
        }
        self
    }

    pub fn with_observer(mut self, observer: ErrorObserver) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.observer = observer;
        }
        self
    }

    pub fn entries(&self) -> &[Arc<CronEntry>] {
        &self.shared.entries
    }

    pub fn find(&self, key: &str) -> Option<&Arc<CronEntry>> {
        self.shared.entries.iter().find(|e| e.key() == key)
    }

    /// The armed fire time while running, otherwise the next one from now.
    pub fn next_scheduled_at(&self, key: &str) -> Option<DateTime<Utc>> {
        let entry = self.find(key)?;
        if self.is_running() {
            entry.armed_at()
        } else {
            entry.next_at(None)
        }
    }

    /// Enqueue `key`'s job right now, enabled or not, outside the schedule.
    /// `None` when no entry has that key.
    pub fn enqueue_now(&self, key: &str) -> Option<Result<JobId, AdapterError>> {
        let entry = self.find(key)?;
        let mut job = entry.base_job();
        job.cron_key = Some(entry.key().to_string());
        info!(cron_key = %key, "enqueueing cron entry on demand");
        Some(self.shared.submitter.submit(&mut job))
    }

    pub fn start(&self) -> io::Result<()> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if self.running.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.doorbell.reopen();

        for entry in &self.shared.entries {
            debug!(cron_key = %entry.key(), expression = %entry.expression(), "arming cron entry");
            let shared = self.shared.clone();
            let looped = entry.clone();
            let spawned = thread::Builder::new()
                .name(format!("lockstep-cron-loop-{}", entry.key()))
                .spawn(move || shared.run(&looped));
            match spawned {
                Ok(handle) => threads.push(handle),
                Err(err) => {
                    self.shared.doorbell.close();
                    for handle in threads.drain(..) {
                        let _ = handle.join();
                    }
                    return Err(err);
                }
            }

            if let Some(period) = self.shared.graceful_restart_period {
                self.shared.replay(entry, period);
            }
        }

        self.running.store(true, Ordering::SeqCst);
        info!(entries = self.shared.entries.len(), "cron manager started");
        Ok(())
    }

    /// Cancel every armed timer. Firings already dispatched run to completion.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shared.doorbell.close();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!("cron scheduler thread panicked");
            }
        }
        for entry in &self.shared.entries {
            entry.arm(None);
        }
        info!("cron manager stopped");
    }

    pub fn restart(&self) -> io::Result<()> {
        self.shutdown();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Managed for CronManager {
    fn name(&self) -> &str {
        "cron"
    }

    fn start(&self) -> io::Result<()> {
        CronManager::start(self)
    }

    fn shutdown(&self) {
        CronManager::shutdown(self)
    }

    fn is_running(&self) -> bool {
        CronManager::is_running(self)
    }
}

impl Drop for CronManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for CronManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<&str> = self.shared.entries.iter().map(|e| e.key()).collect();
        f.debug_struct("CronManager")
            .field("entries", &keys)
            .field("running", &self.is_running())
            .finish()
    }
}
