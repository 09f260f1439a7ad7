//! Worker pool ("capsule"): threads that claim and execute due records.
//!
//! Every queue group gets its own set of worker threads. An idle worker
//! blocks on the shared [`Doorbell`] until the poll interval elapses or a
//! notification rings it, so the bus only shortens latency; polling is what
//! guarantees every due record is eventually claimed.

use std::collections::BTreeSet;
use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thread_priority::{ThreadPriority, set_current_thread_priority};
use tracing::{debug, error, info, warn};

use lockstep_core::JobId;
use lockstep_events::{Doorbell, JobNotification, NotifyBus, NullBus, Subscription, Wake};

use super::cleanup::{CleanupOptions, CleanupTracker, cleanup_preserved_jobs};
use super::executor::JobExecutor;
use super::lifecycle::Managed;
use super::observer::ErrorSource;
use super::pause::PauseRegistry;
use super::queues::{QueueGroup, QueueSelector};
use super::types::{ClaimQuery, PriorityOrder};

/// Longest the listener blocks before re-checking for shutdown.
const LISTEN_TICK: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct CapsuleConfig {
    pub queues: Vec<QueueGroup>,
    /// Threads for groups that don't name their own count.
    pub max_threads: usize,
    pub poll_interval: Duration,
    pub priority_order: PriorityOrder,
    /// Run workers at the minimum OS thread priority so the host process
    /// keeps the CPU.
    pub lower_thread_priority: bool,
    pub cleanup: CleanupOptions,
}

impl Default for CapsuleConfig {
    fn default() -> Self {
        Self {
            queues: vec![QueueGroup {
                selector: QueueSelector::All,
                threads: None,
            }],
            max_threads: 5,
            poll_interval: Duration::from_secs(10),
            priority_order: PriorityOrder::default(),
            lower_thread_priority: false,
            cleanup: CleanupOptions::default(),
        }
    }
}

impl CapsuleConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_max_threads(mut self, max_threads: usize) -> Self {
        self.max_threads = max_threads.max(1);
        self
    }

    pub fn with_queues(mut self, queues: Vec<QueueGroup>) -> Self {
        self.queues = queues;
        self
    }

    fn thread_count(&self, group: &QueueGroup) -> usize {
        group.threads.unwrap_or(self.max_threads).max(1)
    }
}

struct Shared {
    config: CapsuleConfig,
    executor: JobExecutor,
    bus: Arc<dyn NotifyBus>,
    pauses: Arc<PauseRegistry>,
    tracker: Mutex<CleanupTracker>,
    doorbell: Doorbell,
    /// Future due times announced by notifications, rung when reached.
    wake_at: Mutex<BTreeSet<DateTime<Utc>>>,
    executed: AtomicU64,
    lowered: AtomicUsize,
}

impl Shared {
    fn listens_to(&self, queue: &str) -> bool {
        self.config.queues.iter().any(|g| g.selector.matches(queue))
    }

    fn wake(&self, notification: &JobNotification) {
        if !self.listens_to(&notification.queue_name) {
            return;
        }
        if notification.is_due(Utc::now()) {
            self.doorbell.ring();
        } else {
            self.wake_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(notification.scheduled_at);
        }
    }

    /// Ring for every announced time that has arrived; returns how long until
    /// the next one.
    fn ring_due(&self) -> Option<Duration> {
        let now = Utc::now();
        let mut wake_at = self.wake_at.lock().unwrap_or_else(PoisonError::into_inner);
        let mut rang = false;
        while wake_at.first().is_some_and(|at| *at <= now) {
            wake_at.pop_first();
            rang = true;
        }
        if rang {
            self.doorbell.ring();
        }
        wake_at
            .first()
            .map(|at| (*at - now).to_std().unwrap_or(Duration::ZERO))
    }

    fn after_job(&self) {
        self.executed.fetch_add(1, Ordering::Relaxed);

        let mut tracker = self.tracker.lock().unwrap_or_else(PoisonError::into_inner);
        tracker.increment();
        if !tracker.cleanup() {
            return;
        }
        match cleanup_preserved_jobs(self.executor.store(), self.config.cleanup) {
            Ok(_) => tracker.reset(),
            Err(err) => error!(error = %err, "cleanup of preserved jobs failed"),
        }
    }
}

/// A pool of worker threads over one job store.
pub struct Capsule {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Capsule {
    pub fn new(config: CapsuleConfig, executor: JobExecutor) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                executor,
                bus: Arc::new(NullBus),
                pauses: PauseRegistry::arc(),
                tracker: Mutex::new(CleanupTracker::disabled()),
                doorbell: Doorbell::new(),
                wake_at: Mutex::new(BTreeSet::new()),
                executed: AtomicU64::new(0),
                lowered: AtomicUsize::new(0),
            }),
            threads: Mutex::new(Vec::new()),
        }
    }

    pub fn with_bus(self, bus: Arc<dyn NotifyBus>) -> Self {
        self.map_shared(|s| s.bus = bus)
    }

    pub fn with_pauses(self, pauses: Arc<PauseRegistry>) -> Self {
        self.map_shared(|s| s.pauses = pauses)
    }

    pub fn with_cleanup_tracker(self, tracker: CleanupTracker) -> Self {
        self.map_shared(|s| s.tracker = Mutex::new(tracker))
    }

    fn map_shared(mut self, f: impl FnOnce(&mut Shared)) -> Self {
        match Arc::get_mut(&mut self.shared) {
            Some(shared) => f(shared),
            None => warn!("capsule reconfigured after start; ignoring"),
        }
        self
    }

    pub fn config(&self) -> &CapsuleConfig {
        &self.shared.config
    }

    pub fn pauses(&self) -> &Arc<PauseRegistry> {
        &self.shared.pauses
    }

    /// Jobs this capsule has run to a terminal state since construction.
    pub fn executed_count(&self) -> u64 {
        self.shared.executed.load(Ordering::Relaxed)
    }

    /// Worker threads that dropped to the minimum OS priority on start.
    pub fn lowered_priority_workers(&self) -> usize {
        self.shared.lowered.load(Ordering::Relaxed)
    }

    /// Local wake-up for work enqueued in this process.
    pub fn wake(&self, notification: &JobNotification) {
        self.shared.wake(notification);
    }

    /// Start worker threads and the notification listener. Idempotent.
    pub fn start(&self) -> io::Result<()> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !threads.is_empty() {
            return Ok(());
        }
        self.shared.doorbell.reopen();

        let mut spawned = Vec::new();
        let result = self.spawn_all(&mut spawned);
        if let Err(err) = result {
            self.shared.doorbell.close();
            for handle in spawned {
                let _ = handle.join();
            }
            return Err(err);
        }

        info!(
            groups = self.shared.config.queues.len(),
            threads = spawned.len() - 1,
            "capsule started"
        );
        *threads = spawned;
        Ok(())
    }

    fn spawn_all(&self, spawned: &mut Vec<JoinHandle<()>>) -> io::Result<()> {
        let subscription = self.shared.bus.subscribe();
        let shared = self.shared.clone();
        spawned.push(
            thread::Builder::new()
                .name("lockstep-listener".to_string())
                .spawn(move || listen(&shared, subscription))?,
        );

        for (g, group) in self.shared.config.queues.iter().enumerate() {
            for n in 0..self.shared.config.thread_count(group) {
                let shared = self.shared.clone();
                let selector = group.selector.clone();
                let name = format!("lockstep-worker-{g}-{n}");
                let worker = name.clone();
                spawned.push(
                    thread::Builder::new()
                        .name(name)
                        .spawn(move || work(&shared, &selector, &worker))?,
                );
            }
        }
        Ok(())
    }

    /// Stop claiming, let in-flight jobs finish, join every thread. Idempotent.
    pub fn shutdown(&self) {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if threads.is_empty() {
            return;
        }
        self.shared.doorbell.close();
        for handle in threads.drain(..) {
            if handle.join().is_err() {
                error!("capsule thread panicked");
            }
        }
        info!("capsule stopped");
    }

    pub fn restart(&self) -> io::Result<()> {
        self.shutdown();
        self.start()
    }

    pub fn is_running(&self) -> bool {
        !self
            .threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_empty()
    }
}

impl Managed for Capsule {
    fn name(&self) -> &str {
        "capsule"
    }

    fn start(&self) -> io::Result<()> {
        Capsule::start(self)
    }

    fn shutdown(&self) {
        Capsule::shutdown(self)
    }

    fn is_running(&self) -> bool {
        Capsule::is_running(self)
    }
}

impl Drop for Capsule {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Capsule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capsule")
            .field("config", &self.shared.config)
            .field("running", &self.is_running())
            .finish()
    }
}

fn work(shared: &Shared, selector: &QueueSelector, worker: &str) {
    debug!(worker, %selector, "worker started");
    if shared.config.lower_thread_priority {
        match set_current_thread_priority(ThreadPriority::Min) {
            Ok(()) => {
                shared.lowered.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => warn!(worker, error = ?err, "could not lower worker thread priority"),
        }
    }
    // Records claimed and released unexecuted (paused) since the last idle
    // wait; passed over so one paused record can't starve the rest.
    let mut skip: Vec<JobId> = Vec::new();

    loop {
        if shared.doorbell.is_closed() {
            break;
        }
        let ticket = shared.doorbell.ticket();
        let query = ClaimQuery::new(selector.clone(), shared.config.priority_order)
            .skipping(skip.clone());

        match shared.executor.store().claim_next(&query) {
            Ok(Some(claimed)) => {
                if shared.pauses.is_record_paused(&claimed.record) {
                    debug!(worker, job_id = %claimed.record.id, "job paused, releasing");
                    if let Err(err) = shared.executor.store().release(&claimed.lease) {
                        warn!(worker, error = %err, "failed to release paused job");
                    }
                    skip.push(claimed.record.id);
                    continue;
                }

                // Failures were already recorded and observed.
                let _ = shared.executor.execute(claimed, ErrorSource::Worker);
                shared.after_job();
                continue;
            }
            Ok(None) => {}
            Err(err) => error!(worker, error = %err, "claim failed"),
        }

        skip.clear();
        if shared.doorbell.wait(ticket, shared.config.poll_interval) == Wake::Closed {
            break;
        }
    }
    debug!(worker, "worker stopped");
}

fn listen(shared: &Shared, subscription: Subscription<JobNotification>) {
    use std::sync::mpsc::RecvTimeoutError;

    let mut subscription = Some(subscription);
    while !shared.doorbell.is_closed() {
        let timeout = shared
            .ring_due()
            .map_or(LISTEN_TICK, |until| until.min(LISTEN_TICK));

        match &subscription {
            Some(sub) => match sub.recv_timeout(timeout) {
                Ok(notification) => {
                    debug!(queue = %notification.queue_name, count = notification.count, "notified");
                    shared.wake(&notification);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    debug!("notification channel closed, polling only");
                    subscription = None;
                }
            },
            None => thread::sleep(timeout),
        }
    }
}
