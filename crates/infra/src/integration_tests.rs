//! Integration tests across the job engine's components.
//!
//! Store → adapter → notification → capsule → executor, plus cron and pause
//! interplay. Everything runs against the in-memory store and bus.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, OnceLock};
    use std::thread;
    use std::time::{Duration, Instant};

    use chrono::{DateTime, Utc};

    use lockstep_core::JobId;
    use lockstep_events::InMemoryNotifyBus;

    use crate::config::EngineConfig;
    use crate::jobs::observer::collecting;
    use crate::jobs::{
        Adapter, Capsule, CapsuleConfig, ClaimQuery, ClaimedJob, CleanupTracker, CronEntry,
        CronManager, EngineBuilder, ErrorSource, ExecutionMode, InMemoryJobStore, JobExecutor,
        JobRecord, JobRegistry, JobStore, JobStoreError, Lease, NewJob, PauseRegistry,
        PauseTarget, ProcessRole,
    };

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let started = Instant::now();
        while started.elapsed() < timeout {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        done()
    }

    fn seed(store: &InMemoryJobStore, n: usize, class: &str, queue: &str) -> Vec<JobId> {
        (0..n)
            .map(|i| {
                let job = NewJob::new(class, serde_json::json!({ "i": i })).on_queue(queue);
                store.insert(job.to_record(Utc::now())).unwrap()
            })
            .collect()
    }

    /// Counts body runs per record id.
    fn counting_registry(class: &str) -> (JobRegistry, Arc<Mutex<HashMap<JobId, usize>>>) {
        let runs = Arc::new(Mutex::new(HashMap::new()));
        let seen = runs.clone();
        let registry = JobRegistry::new().with(class, move |record: &JobRecord| {
            *seen.lock().unwrap().entry(record.id).or_insert(0) += 1;
            Ok(())
        });
        (registry, runs)
    }

    fn pool(store: Arc<InMemoryJobStore>, registry: JobRegistry, threads: usize) -> Capsule {
        Capsule::new(
            CapsuleConfig::default()
                .with_max_threads(threads)
                .with_poll_interval(Duration::from_millis(20)),
            JobExecutor::new(store, Arc::new(registry)),
        )
    }

    #[test]
    fn concurrent_pools_run_every_record_exactly_once() {
        lockstep_observability::init_for_tests();
        let store = InMemoryJobStore::arc();
        let ids = seed(&store, 200, "Work", "default");
        let (registry, runs) = counting_registry("Work");

        // Two pools over one store stand in for two worker processes.
        let a = pool(store.clone(), registry.clone(), 4);
        let b = pool(store.clone(), registry, 4);
        a.start().unwrap();
        b.start().unwrap();

        assert!(wait_until(Duration::from_secs(10), || store.unfinished_count() == 0));
        a.shutdown();
        b.shutdown();

        let runs = runs.lock().unwrap();
        assert_eq!(runs.len(), ids.len());
        assert!(ids.iter().all(|id| runs.get(id) == Some(&1)));
        assert_eq!(a.executed_count() + b.executed_count(), 200);
        assert!(store.all().iter().all(|r| r.finished_at.is_some() && r.locked_by.is_none()));
    }

    #[test]
    fn restarting_a_pool_mid_drain_loses_nothing() {
        let store = InMemoryJobStore::arc();
        seed(&store, 50, "Work", "default");
        let (registry, runs) = counting_registry("Work");
        let capsule = pool(store.clone(), registry, 2);

        capsule.start().unwrap();
        capsule.start().unwrap();
        capsule.restart().unwrap();
        capsule.restart().unwrap();

        assert!(wait_until(Duration::from_secs(10), || store.unfinished_count() == 0));
        capsule.shutdown();
        assert!(runs.lock().unwrap().values().all(|n| *n == 1));
    }

    #[test]
    fn async_engine_runs_enqueued_jobs_through_notifications() {
        let store = InMemoryJobStore::arc();
        let bus = Arc::new(InMemoryNotifyBus::new());
        let (registry, runs) = counting_registry("Work");
        let config = EngineConfig {
            execution_mode: ExecutionMode::AsyncAll,
            poll_interval: Some(60),
            ..EngineConfig::default()
        };
        let engine = EngineBuilder::new(config, ProcessRole::Cli, store.clone())
            .registry(registry)
            .bus(bus.clone())
            .build()
            .unwrap();

        let mut job = NewJob::new("Work", serde_json::Value::Null);
        let id = engine.adapter.enqueue(&mut job).unwrap();

        // The first async enqueue starts the pool and rings it; the minute
        // long poll interval never elapses.
        assert!(wait_until(Duration::from_secs(5), || {
            runs.lock().unwrap().get(&id) == Some(&1)
        }));
        assert!(engine.capsule.is_running());
        assert_eq!(bus.published().len(), 1);

        engine.shutdown();
        assert!(!engine.capsule.is_running());
    }

    #[test]
    fn paused_queue_waits_until_unpaused() {
        let store = InMemoryJobStore::arc();
        let slow = seed(&store, 3, "Work", "slow");
        let fast = seed(&store, 3, "Work", "fast");
        let (registry, runs) = counting_registry("Work");
        let pauses = PauseRegistry::arc();
        pauses.pause(PauseTarget::Queue("slow".into())).unwrap();

        let capsule = pool(store.clone(), registry, 2).with_pauses(pauses.clone());
        capsule.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            let runs = runs.lock().unwrap();
            fast.iter().all(|id| runs.contains_key(id))
        }));
        // A few more polls; the paused records must stay untouched.
        thread::sleep(Duration::from_millis(100));
        capsule.shutdown();
        for id in &slow {
            assert!(store.get(*id).unwrap().unwrap().finished_at.is_none());
            assert!(!store.is_locked(*id).unwrap());
        }

        pauses.unpause(PauseTarget::Queue("slow".into())).unwrap();
        assert!(!pauses.is_paused(Some("slow"), None, &[]));
        capsule.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || store.unfinished_count() == 0));
        capsule.shutdown();
    }

    #[test]
    fn cleanup_fires_after_the_job_threshold() {
        let store = InMemoryJobStore::arc();
        let (registry, _runs) = counting_registry("Work");
        let config = CapsuleConfig {
            cleanup: crate::jobs::CleanupOptions {
                older_than: chrono::Duration::zero(),
                ..Default::default()
            },
            ..CapsuleConfig::default()
        }
        .with_max_threads(1)
        .with_poll_interval(Duration::from_millis(20));
        let capsule = Capsule::new(config, JobExecutor::new(store.clone(), Arc::new(registry)))
            .with_cleanup_tracker(CleanupTracker::new(None, Some(2)).unwrap());

        seed(&store, 2, "Work", "default");
        capsule.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || store.unfinished_count() == 0));
        thread::sleep(Duration::from_millis(50));
        // Two jobs is not more than two: nothing swept yet.
        assert_eq!(store.all().len(), 2);

        seed(&store, 1, "Work", "default");
        assert!(wait_until(Duration::from_secs(5), || store.all().len() < 3));
        capsule.shutdown();
    }

    /// Persists only the first record of every batch.
    struct FirstOnly(InMemoryJobStore);

    impl JobStore for FirstOnly {
        fn insert(&self, record: JobRecord) -> Result<JobId, JobStoreError> {
            self.0.insert(record)
        }

        fn insert_batch(&self, records: Vec<JobRecord>) -> Result<Vec<Option<JobId>>, JobStoreError> {
            Ok(records
                .into_iter()
                .enumerate()
                .map(|(i, r)| if i == 0 { self.0.insert(r).ok() } else { None })
                .collect())
        }

        fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
            self.0.get(id)
        }

        fn claim_next(&self, query: &ClaimQuery) -> Result<Option<ClaimedJob>, JobStoreError> {
            self.0.claim_next(query)
        }

        fn acquire(&self, id: JobId) -> Result<Option<ClaimedJob>, JobStoreError> {
            self.0.acquire(id)
        }

        fn is_locked(&self, id: JobId) -> Result<bool, JobStoreError> {
            self.0.is_locked(id)
        }

        fn mark_performing(&self, lease: &Lease) -> Result<(), JobStoreError> {
            self.0.mark_performing(lease)
        }

        fn mark_finished(&self, lease: &Lease, error: Option<&str>) -> Result<(), JobStoreError> {
            self.0.mark_finished(lease, error)
        }

        fn release(&self, lease: &Lease) -> Result<(), JobStoreError> {
            self.0.release(lease)
        }

        fn delete_finished(
            &self,
            cutoff: DateTime<Utc>,
            include_discarded: bool,
            limit: usize,
        ) -> Result<usize, JobStoreError> {
            self.0.delete_finished(cutoff, include_discarded, limit)
        }
    }

    #[test]
    fn partially_persisted_batches_count_and_notify_only_what_was_stored() {
        let store = Arc::new(FirstOnly(InMemoryJobStore::new()));
        let bus = Arc::new(InMemoryNotifyBus::new());
        let executor = JobExecutor::new(store.clone(), Arc::new(JobRegistry::new()));
        let adapter =
            Adapter::new(ExecutionMode::External, ProcessRole::Cli, executor).with_bus(bus.clone());

        let mut jobs: Vec<NewJob> = (0..3)
            .map(|_| NewJob::new("Work", serde_json::Value::Null))
            .collect();
        assert_eq!(adapter.enqueue_all(&mut jobs).unwrap(), 1);

        assert!(jobs[0].provider_job_id.is_some());
        assert!(jobs[1..].iter().all(|j| j.provider_job_id.is_none()));
        let published = bus.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].count, 1);
    }

    #[test]
    fn inline_mode_defers_future_jobs_and_surfaces_failures() {
        let store = InMemoryJobStore::arc();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = ran.clone();
        let registry = JobRegistry::new()
            .with("Work", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .with("Broken", |_| anyhow::bail!("nope"));
        let (observer, seen) = collecting();
        let executor =
            JobExecutor::new(store.clone(), Arc::new(registry)).with_observer(observer);
        let adapter = Adapter::new(ExecutionMode::Inline, ProcessRole::Server, executor);

        let later = Utc::now() + chrono::Duration::minutes(5);
        let deferred = adapter
            .enqueue_at(&mut NewJob::new("Work", serde_json::Value::Null), later)
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(store.get(deferred).unwrap().unwrap().finished_at.is_none());

        adapter
            .enqueue(&mut NewJob::new("Work", serde_json::Value::Null))
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        assert!(adapter
            .enqueue(&mut NewJob::new("Broken", serde_json::Value::Null))
            .is_err());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1.source, ErrorSource::Inline);
    }

    #[test]
    fn cron_arms_the_next_firing_before_the_body_runs() {
        let store = InMemoryJobStore::arc();
        let manager: Arc<OnceLock<Arc<CronManager>>> = Arc::new(OnceLock::new());
        let observed: Arc<Mutex<Vec<(DateTime<Utc>, Option<DateTime<Utc>>)>>> =
            Arc::new(Mutex::new(Vec::new()));

        let (handle, log) = (manager.clone(), observed.clone());
        let registry = JobRegistry::new().with("Tick", move |record: &JobRecord| {
            let next = handle.get().and_then(|m| m.next_scheduled_at("tick"));
            if let Some(cron_at) = record.cron_at {
                log.lock().unwrap().push((cron_at, next));
            }
            thread::sleep(Duration::from_millis(300));
            Ok(())
        });
        let executor = JobExecutor::new(store.clone(), Arc::new(registry));
        let adapter = Arc::new(Adapter::new(ExecutionMode::Inline, ProcessRole::Cli, executor));

        let cron = Arc::new(CronManager::new(
            vec![CronEntry::parse("tick", "* * * * * *", "Tick").unwrap()],
            adapter,
        ));
        let _ = manager.set(cron.clone());
        cron.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || observed.lock().unwrap().len() >= 2));
        cron.shutdown();

        for (cron_at, next) in observed.lock().unwrap().iter() {
            assert!(next.is_some_and(|next| next > *cron_at), "{cron_at} -> {next:?}");
        }
    }

    #[test]
    fn two_cron_managers_enqueue_each_firing_once() {
        let store = InMemoryJobStore::arc();
        let managers: Vec<CronManager> = (0..2)
            .map(|_| {
                let executor = JobExecutor::new(store.clone(), Arc::new(JobRegistry::new()));
                let adapter = Adapter::new(ExecutionMode::External, ProcessRole::Cli, executor);
                CronManager::new(
                    vec![CronEntry::parse("tick", "* * * * * *", "Tick").unwrap()],
                    Arc::new(adapter),
                )
            })
            .collect();
        for m in &managers {
            m.start().unwrap();
        }

        assert!(wait_until(Duration::from_secs(5), || store.all().len() >= 2));
        for m in &managers {
            m.shutdown();
        }
        thread::sleep(Duration::from_millis(100));

        let mut anchors: Vec<_> = store.all().iter().filter_map(|r| r.cron_at).collect();
        let total = anchors.len();
        anchors.sort();
        anchors.dedup();
        assert_eq!(anchors.len(), total);
    }

    #[test]
    fn failing_cron_bodies_are_reported_once_each() {
        let store = InMemoryJobStore::arc();
        let (observer, seen) = collecting();
        let registry = JobRegistry::new().with("Tick", |_| anyhow::bail!("tick failed"));
        let executor =
            JobExecutor::new(store.clone(), Arc::new(registry)).with_observer(observer.clone());
        let adapter = Adapter::new(ExecutionMode::Inline, ProcessRole::Cli, executor);
        let cron = CronManager::new(
            vec![CronEntry::parse("tick", "* * * * * *", "Tick").unwrap()],
            Arc::new(adapter),
        )
        .with_observer(observer);

        cron.start().unwrap();
        assert!(wait_until(Duration::from_secs(5), || seen.lock().unwrap().len() >= 2));
        cron.shutdown();
        thread::sleep(Duration::from_millis(200));

        let discarded = store.all().iter().filter(|r| r.is_discarded()).count();
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), discarded);
        assert!(seen.iter().all(|(_, ctx)| {
            ctx.source == ErrorSource::Cron && ctx.cron_key.as_deref() == Some("tick")
        }));
    }
}
