//! Coordinated start/stop of every long-running component in a process.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::info;

/// A component with threads to start and join.
pub trait Managed: Send + Sync {
    fn name(&self) -> &str;

    /// Idempotent.
    fn start(&self) -> io::Result<()>;

    /// Idempotent; returns once the component's threads have exited.
    fn shutdown(&self);

    fn is_running(&self) -> bool;

    fn restart(&self) -> io::Result<()> {
        self.shutdown();
        self.start()
    }
}

/// Owns the set of managed components for one process.
///
/// Built once at process start and handed to whatever needs coordinated
/// shutdown (signal handlers, the submission adapter, tests).
pub struct Lifecycle {
    components: Mutex<Vec<Arc<dyn Managed>>>,
    start_allowed: bool,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            start_allowed: true,
        }
    }

    /// A lifecycle whose `restart` only stops components, for processes that
    /// must not execute jobs themselves (external mode inside a server).
    pub fn without_starts() -> Self {
        Self {
            components: Mutex::new(Vec::new()),
            start_allowed: false,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn start_allowed(&self) -> bool {
        self.start_allowed
    }

    pub fn register(&self, component: Arc<dyn Managed>) {
        self.lock().push(component);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn start(&self) -> io::Result<()> {
        if !self.start_allowed {
            return Ok(());
        }
        for component in self.snapshot() {
            component.start()?;
        }
        Ok(())
    }

    /// Shut every component down, in reverse registration order.
    pub fn shutdown(&self) {
        let components = self.snapshot();
        info!(components = components.len(), "shutting down");
        for component in components.iter().rev() {
            component.shutdown();
        }
    }

    pub fn restart(&self) -> io::Result<()> {
        self.shutdown();
        self.start()
    }

    /// True when no registered component is running.
    pub fn is_shutdown(&self) -> bool {
        self.snapshot().iter().all(|c| !c.is_running())
    }

    fn snapshot(&self) -> Vec<Arc<dyn Managed>> {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Arc<dyn Managed>>> {
        self.components.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.snapshot().iter().map(|c| c.name().to_string()).collect();
        f.debug_struct("Lifecycle")
            .field("components", &names)
            .field("start_allowed", &self.start_allowed)
            .finish()
    }
}
