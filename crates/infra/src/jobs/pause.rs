//! Pause registry: a process-wide deny gate on queues, job classes and labels.
//!
//! State is three string sets. Membership in any dimension pauses a record.
//! When backed by a [`PauseStore`], every check re-reads the store so pauses
//! set by other processes take effect on the next claim.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use lockstep_core::{ConfigError, ConfigResult};

use super::store::JobStoreError;
use super::types::JobRecord;

/// One pausable thing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseTarget {
    Queue(String),
    JobClass(String),
    Label(String),
}

impl PauseTarget {
    /// Build from the keyword form, where exactly one part must be given.
    pub fn from_parts(
        queue: Option<&str>,
        job_class: Option<&str>,
        label: Option<&str>,
    ) -> ConfigResult<Self> {
        match (queue, job_class, label) {
            (Some(q), None, None) => Ok(PauseTarget::Queue(q.to_string())),
            (None, Some(c), None) => Ok(PauseTarget::JobClass(c.to_string())),
            (None, None, Some(l)) => Ok(PauseTarget::Label(l.to_string())),
            _ => Err(ConfigError::InvalidPauseTarget),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PauseTarget::Queue(_) => "queue",
            PauseTarget::JobClass(_) => "job_class",
            PauseTarget::Label(_) => "label",
        }
    }

    pub fn value(&self) -> &str {
        match self {
            PauseTarget::Queue(v) | PauseTarget::JobClass(v) | PauseTarget::Label(v) => v,
        }
    }
}

/// Snapshot of everything paused, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PausedSnapshot {
    pub queues: BTreeSet<String>,
    pub job_classes: BTreeSet<String>,
    pub labels: BTreeSet<String>,
}

impl PausedSnapshot {
    fn set_mut(&mut self, target: &PauseTarget) -> &mut BTreeSet<String> {
        match target {
            PauseTarget::Queue(_) => &mut self.queues,
            PauseTarget::JobClass(_) => &mut self.job_classes,
            PauseTarget::Label(_) => &mut self.labels,
        }
    }

    /// Returns false when the pair was already present.
    pub fn insert(&mut self, target: &PauseTarget) -> bool {
        self.set_mut(target).insert(target.value().to_string())
    }

    /// Returns false when the pair was absent.
    pub fn remove(&mut self, target: &PauseTarget) -> bool {
        self.set_mut(target).remove(target.value())
    }

    pub fn contains(&self, target: &PauseTarget) -> bool {
        match target {
            PauseTarget::Queue(v) => self.queues.contains(v),
            PauseTarget::JobClass(v) => self.job_classes.contains(v),
            PauseTarget::Label(v) => self.labels.contains(v),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty() && self.job_classes.is_empty() && self.labels.is_empty()
    }

    /// Logical OR across the provided dimensions.
    pub fn matches(&self, queue: Option<&str>, job_class: Option<&str>, labels: &[String]) -> bool {
        queue.is_some_and(|q| self.queues.contains(q))
            || job_class.is_some_and(|c| self.job_classes.contains(c))
            || labels.iter().any(|l| self.labels.contains(l))
    }
}

/// Durable pause state shared between processes.
pub trait PauseStore: Send + Sync {
    fn load(&self) -> Result<PausedSnapshot, JobStoreError>;

    fn set(&self, target: &PauseTarget, paused: bool) -> Result<(), JobStoreError>;
}

impl<S> PauseStore for Arc<S>
where
    S: PauseStore + ?Sized,
{
    fn load(&self) -> Result<PausedSnapshot, JobStoreError> {
        (**self).load()
    }

    fn set(&self, target: &PauseTarget, paused: bool) -> Result<(), JobStoreError> {
        (**self).set(target, paused)
    }
}

/// In-memory pause store for tests/dev; share one `Arc` between registries to
/// model several processes.
#[derive(Debug, Default)]
pub struct InMemoryPauseStore {
    state: Mutex<PausedSnapshot>,
}

impl InMemoryPauseStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PauseStore for InMemoryPauseStore {
    fn load(&self) -> Result<PausedSnapshot, JobStoreError> {
        Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    fn set(&self, target: &PauseTarget, paused: bool) -> Result<(), JobStoreError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if paused {
            state.insert(target);
        } else {
            state.remove(target);
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct PauseRegistry {
    cached: RwLock<PausedSnapshot>,
    store: Option<Arc<dyn PauseStore>>,
}

impl PauseRegistry {
    /// Process-local registry, empty at start.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry persisted through `store`.
    pub fn with_store(store: Arc<dyn PauseStore>) -> Self {
        let cached = store.load().unwrap_or_else(|err| {
            warn!(error = %err, "failed to load pause state, starting empty");
            PausedSnapshot::default()
        });
        Self {
            cached: RwLock::new(cached),
            store: Some(store),
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn pause(&self, target: PauseTarget) -> Result<(), JobStoreError> {
        self.apply(&target, true)
    }

    pub fn unpause(&self, target: PauseTarget) -> Result<(), JobStoreError> {
        self.apply(&target, false)
    }

    /// True when any provided dimension is paused.
    pub fn is_paused(&self, queue: Option<&str>, job_class: Option<&str>, labels: &[String]) -> bool {
        self.refresh();
        self.read().matches(queue, job_class, labels)
    }

    pub fn is_record_paused(&self, record: &JobRecord) -> bool {
        self.is_paused(
            Some(&record.queue_name),
            Some(&record.job_class),
            &record.labels,
        )
    }

    pub fn paused(&self) -> PausedSnapshot {
        self.refresh();
        self.read().clone()
    }

    fn apply(&self, target: &PauseTarget, paused: bool) -> Result<(), JobStoreError> {
        if let Some(store) = &self.store {
            store.set(target, paused)?;
        }
        let mut cached = self.cached.write().unwrap_or_else(PoisonError::into_inner);
        if paused {
            cached.insert(target);
        } else {
            cached.remove(target);
        }
        Ok(())
    }

    fn refresh(&self) {
        let Some(store) = &self.store else { return };
        match store.load() {
            Ok(fresh) => *self.cached.write().unwrap_or_else(PoisonError::into_inner) = fresh,
            // Keep the last known state rather than dropping every pause.
            Err(err) => warn!(error = %err, "failed to reload pause state"),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PausedSnapshot> {
        self.cached.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for PauseRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PauseRegistry")
            .field("paused", &*self.read())
            .field("persisted", &self.store.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(q: &str) -> PauseTarget {
        PauseTarget::Queue(q.to_string())
    }

    #[test]
    fn empty_at_start() {
        let registry = PauseRegistry::new();
        assert!(registry.paused().is_empty());
        assert!(!registry.is_paused(Some("default"), None, &[]));
    }

    #[test]
    fn pause_and_unpause_a_queue() {
        let registry = PauseRegistry::new();
        registry.pause(queue("default")).unwrap();
        assert!(registry.is_paused(Some("default"), None, &[]));
        assert!(!registry.is_paused(Some("other"), None, &[]));

        registry.unpause(queue("default")).unwrap();
        assert!(!registry.is_paused(Some("default"), None, &[]));
    }

    #[test]
    fn any_dimension_matches() {
        let registry = PauseRegistry::new();
        registry.pause(PauseTarget::JobClass("Mailer".into())).unwrap();
        registry.pause(PauseTarget::Label("slow".into())).unwrap();

        assert!(registry.is_paused(Some("default"), Some("Mailer"), &[]));
        assert!(registry.is_paused(None, None, &["fast".into(), "slow".into()]));
        assert!(!registry.is_paused(Some("default"), Some("Report"), &["fast".into()]));
    }

    #[test]
    fn snapshot_lists_each_dimension() {
        let registry = PauseRegistry::new();
        registry.pause(queue("b")).unwrap();
        registry.pause(queue("a")).unwrap();
        registry.pause(PauseTarget::Label("x".into())).unwrap();

        let snapshot = registry.paused();
        assert_eq!(snapshot.queues.iter().collect::<Vec<_>>(), ["a", "b"]);
        assert!(snapshot.job_classes.is_empty());
        assert_eq!(snapshot.labels.len(), 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["queues"], serde_json::json!(["a", "b"]));
    }

    #[test]
    fn exactly_one_part_is_required() {
        assert_eq!(
            PauseTarget::from_parts(Some("q"), None, None).unwrap(),
            queue("q")
        );
        assert_eq!(
            PauseTarget::from_parts(None, None, None),
            Err(ConfigError::InvalidPauseTarget)
        );
        assert_eq!(
            PauseTarget::from_parts(Some("q"), Some("C"), None),
            Err(ConfigError::InvalidPauseTarget)
        );
    }

    #[test]
    fn persisted_pauses_are_seen_by_other_registries() {
        let store: Arc<dyn PauseStore> = Arc::new(InMemoryPauseStore::new());
        let here = PauseRegistry::with_store(store.clone());
        let there = PauseRegistry::with_store(store);

        here.pause(queue("default")).unwrap();
        assert!(there.is_paused(Some("default"), None, &[]));

        there.unpause(queue("default")).unwrap();
        assert!(!here.is_paused(Some("default"), None, &[]));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Debug, Clone)]
        enum Op {
            Pause(PauseTarget),
            Unpause(PauseTarget),
        }

        fn target() -> impl Strategy<Value = PauseTarget> {
            prop_oneof![
                "[a-c]".prop_map(PauseTarget::Queue),
                "[a-c]".prop_map(PauseTarget::JobClass),
                "[a-c]".prop_map(PauseTarget::Label),
            ]
        }

        fn op() -> impl Strategy<Value = Op> {
            prop_oneof![target().prop_map(Op::Pause), target().prop_map(Op::Unpause)]
        }

        proptest! {
            /// Property: the registry behaves like a plain set of pairs, so
            /// repeated pauses are idempotent and the last op per pair wins.
            #[test]
            fn behaves_like_a_set(ops in prop::collection::vec(op(), 0..40)) {
                let registry = PauseRegistry::new();
                let mut model = std::collections::HashSet::new();

                for op in &ops {
                    match op {
                        Op::Pause(t) => {
                            registry.pause(t.clone()).unwrap();
                            model.insert(t.clone());
                        }
                        Op::Unpause(t) => {
                            registry.unpause(t.clone()).unwrap();
                            model.remove(t);
                        }
                    }
                }

                let snapshot = registry.paused();
                let total = snapshot.queues.len() + snapshot.job_classes.len() + snapshot.labels.len();
                prop_assert_eq!(total, model.len());
                for t in &model {
                    prop_assert!(snapshot.contains(t));
                }
            }
        }
    }
}
