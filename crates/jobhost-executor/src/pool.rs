//! Fixed set of execution contexts.

use jobhost_core::JobKey;
use jobhost_store::JobRecord;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::context::{ContextDeps, ExecutionContext};
use crate::error::{ExecutionError, Result};
use crate::types::StopReason;

/// Contexts are created once and reused for the life of the pool.
#[derive(Debug)]
pub struct ContextPool {
    contexts: Vec<ExecutionContext>,
    // serialises the running check with the slot claim in `assign`
    assigning: Mutex<()>,
}

impl ContextPool {
    /// Spawn `size` contexts sharing `deps`. Must be called from within a
    /// tokio runtime.
    pub fn new(size: usize, deps: ContextDeps) -> Self {
        let contexts = (0..size)
            .map(|id| ExecutionContext::spawn(id, deps.clone()))
            .collect();
        info!(size, "execution context pool started");
        Self {
            contexts,
            assigning: Mutex::new(()),
        }
    }

    pub fn contexts(&self) -> &[ExecutionContext] {
        &self.contexts
    }

    pub fn available(&self) -> usize {
        self.contexts.iter().filter(|c| c.is_available()).count()
    }

    /// Start `job` on the first free context and return its id.
    ///
    /// A key runs on at most one context; concurrent callers for the same
    /// key see exactly one success.
    pub fn assign(&self, job: Arc<JobRecord>) -> Result<usize> {
        let key = job.key();
        let _assigning = self.assigning.lock().expect("context pool lock poisoned");
        if self.is_running(key) {
            return Err(ExecutionError::AlreadyRunning { key });
        }
        for context in &self.contexts {
            if !context.is_available() {
                continue;
            }
            match context.assign(job.clone()) {
                Ok(()) => {
                    debug!(context = context.id(), job = %key, "job assigned");
                    return Ok(context.id());
                }
                // lost a race for this slot; try the next one
                Err(ExecutionError::ContextBusy { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(ExecutionError::PoolExhausted)
    }

    pub fn is_running(&self, key: JobKey) -> bool {
        self.find(key).is_some()
    }

    pub fn running_jobs(&self) -> Vec<Arc<JobRecord>> {
        self.contexts.iter().filter_map(|c| c.running_job()).collect()
    }

    /// Cancel `key` wherever it runs. Returns false if it is not running.
    pub fn cancel(&self, key: JobKey, reason: StopReason) -> bool {
        match self.find(key) {
            Some(context) => context.cancel(reason),
            None => false,
        }
    }

    fn find(&self, key: JobKey) -> Option<&ExecutionContext> {
        self.contexts
            .iter()
            .find(|c| c.running_job().is_some_and(|j| j.key() == key))
    }
}
