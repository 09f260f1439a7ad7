//! Job class → handler lookup, and panic-safe invocation.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::types::{JobError, JobRecord};

/// Job body. Receives the record it runs for; the arguments are opaque JSON.
pub type JobHandler = Arc<dyn Fn(&JobRecord) -> anyhow::Result<()> + Send + Sync>;

/// Maps job classes to bodies.
///
/// Lookup tries, in order: the exact class name, the longest `prefix.*`
/// pattern the class starts with, then the `*` catch-all.
#[derive(Clone, Default)]
pub struct JobRegistry {
    handlers: HashMap<String, JobHandler>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, pattern: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&JobRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(pattern.into(), Arc::new(handler));
        self
    }

    pub fn with<F>(mut self, pattern: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&JobRecord) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.register(pattern, handler);
        self
    }

    pub fn handler(&self, job_class: &str) -> Option<&JobHandler> {
        if let Some(h) = self.handlers.get(job_class) {
            return Some(h);
        }

        let prefixed = self
            .handlers
            .iter()
            .filter_map(|(pattern, h)| {
                let prefix = pattern.strip_suffix(".*")?;
                job_class
                    .strip_prefix(prefix)
                    .filter(|rest| rest.starts_with('.'))
                    .map(|_| (prefix.len(), h))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, h)| h);

        prefixed.or_else(|| self.handlers.get("*"))
    }

    pub fn contains(&self, job_class: &str) -> bool {
        self.handler(job_class).is_some()
    }

    /// Run the body for `record`. Errors and panics both come back as
    /// [`JobError`]; nothing unwinds past this call.
    pub fn perform(&self, record: &JobRecord) -> Result<(), JobError> {
        let handler = self
            .handler(&record.job_class)
            .ok_or_else(|| JobError::UnknownJobClass(record.job_class.clone()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(record))) {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(JobError::failed(&err)),
            Err(payload) => Err(JobError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut patterns: Vec<&String> = self.handlers.keys().collect();
        patterns.sort();
        f.debug_struct("JobRegistry").field("patterns", &patterns).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
