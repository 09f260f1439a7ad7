//! Wiring: one store, one bus, one registry → adapter, capsule, cron, lifecycle.

use std::io;
use std::sync::Arc;

use tracing::info;

use lockstep_core::ConfigResult;
use lockstep_events::NotifyBus;

use crate::config::EngineConfig;

use super::adapter::{Adapter, ExecutionMode, ProcessRole};
use super::capsule::Capsule;
use super::cron::CronManager;
use super::executor::JobExecutor;
use super::lifecycle::Lifecycle;
use super::observer::{ErrorObserver, log_errors};
use super::pause::PauseRegistry;
use super::registry::JobRegistry;
use super::store::JobStore;

/// Everything a process needs to submit and (maybe) run jobs.
pub struct Engine {
    pub adapter: Arc<Adapter>,
    pub capsule: Arc<Capsule>,
    pub cron: Option<Arc<CronManager>>,
    pub pauses: Arc<PauseRegistry>,
    pub lifecycle: Arc<Lifecycle>,
}

pub struct EngineBuilder {
    config: EngineConfig,
    role: ProcessRole,
    store: Arc<dyn JobStore>,
    registry: JobRegistry,
    bus: Option<Arc<dyn NotifyBus>>,
    pauses: Option<Arc<PauseRegistry>>,
    observer: ErrorObserver,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig, role: ProcessRole, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            role,
            store,
            registry: JobRegistry::new(),
            bus: None,
            pauses: None,
            observer: log_errors(),
        }
    }

    pub fn registry(mut self, registry: JobRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn bus(mut self, bus: Arc<dyn NotifyBus>) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn pauses(mut self, pauses: Arc<PauseRegistry>) -> Self {
        self.pauses = Some(pauses);
        self
    }

    pub fn observer(mut self, observer: ErrorObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Validate configuration and assemble components. Nothing starts yet.
    pub fn build(self) -> ConfigResult<Engine> {
        self.config.validate()?;

        let executor = JobExecutor::new(self.store, Arc::new(self.registry))
            .with_observer(self.observer.clone());
        let pauses = self.pauses.unwrap_or_else(PauseRegistry::arc);

        let mut capsule = Capsule::new(self.config.capsule_config()?, executor.clone())
            .with_pauses(pauses.clone())
            .with_cleanup_tracker(self.config.cleanup_tracker()?);
        let mut adapter = Adapter::new(self.config.execution_mode, self.role, executor)
            .with_priority_order(self.config.priority_order());
        if let Some(bus) = &self.bus {
            capsule = capsule.with_bus(bus.clone());
            adapter = adapter.with_bus(bus.clone());
        }
        let capsule = Arc::new(capsule);

        let can_run_locally = adapter.execute_async();
        let adapter = Arc::new(adapter.with_capsule(capsule.clone()));

        let cron = if self.config.enable_cron {
            let mut manager = CronManager::new(self.config.cron_entries()?, adapter.clone())
                .with_observer(self.observer.clone());
            if let Some(period) = self.config.cron_graceful_restart_period() {
                manager = manager.with_graceful_restart_period(period);
            }
            Some(Arc::new(manager))
        } else {
            None
        };

        // External mode inside a server must never start local workers, even
        // on a process-wide restart.
        let lifecycle = if self.config.execution_mode == ExecutionMode::External
            && self.role == ProcessRole::Server
        {
            Lifecycle::without_starts()
        } else {
            Lifecycle::new()
        };
        lifecycle.register(capsule.clone());
        if let Some(cron) = &cron {
            lifecycle.register(cron.clone());
        }

        info!(
            mode = %self.config.execution_mode,
            role = ?self.role,
            local_workers = can_run_locally,
            cron = cron.is_some(),
            "engine assembled"
        );

        Ok(Engine {
            adapter,
            capsule,
            cron,
            pauses,
            lifecycle: Arc::new(lifecycle),
        })
    }
}

impl Engine {
    /// Start whatever this process should run: local workers when the mode
    /// runs jobs here (or when this process is a dedicated worker), and cron.
    pub fn start(&self, run_workers: bool) -> io::Result<()> {
        if run_workers || self.adapter.execute_async() {
            self.capsule.start()?;
        }
        if let Some(cron) = &self.cron {
            cron.start()?;
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        self.lifecycle.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("adapter", &self.adapter)
            .field("capsule", &self.capsule)
            .field("cron", &self.cron)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}
