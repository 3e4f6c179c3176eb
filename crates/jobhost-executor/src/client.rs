//! Seams to the outside world: the executor component, the connector that
//! binds to it, wake locks, and whoever consumes completions.

use jobhost_core::{ComponentName, OwnerId};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::context::{ContextEvent, Shared};
use crate::error::Result;
use crate::types::{JobOutcome, JobParameters};

/// The executor component once bound. Both calls are one-way: they must
/// return promptly and answer later through `params.callback`.
pub trait JobClient: Send + Sync {
    fn start_work(&self, params: JobParameters);
    fn stop_work(&self, params: JobParameters);
}

/// Starts asynchronous binds to executor components.
pub trait ExecutorConnector: Send + Sync {
    /// Begin binding to `service` on behalf of `owner`.
    ///
    /// The returned handle is dropped through [`Binding::unbind`] when the run
    /// ends. Connection, failure and peer death are reported on `session`,
    /// possibly before this call returns.
    fn bind(
        &self,
        service: &ComponentName,
        owner: OwnerId,
        session: BindSession,
    ) -> Result<Box<dyn Binding>>;
}

/// A live bind. Unbinding also unregisters the death observer.
pub trait Binding: Send {
    fn unbind(self: Box<Self>);
}

/// Reports the progress of one bind back to its execution context.
///
/// Every session belongs to a single run; reports arriving after that run
/// ended are discarded by the context.
#[derive(Clone)]
pub struct BindSession {
    shared: Arc<Shared>,
    run: u64,
    died: Arc<AtomicBool>,
}

impl BindSession {
    pub(crate) fn new(shared: Arc<Shared>, run: u64) -> Self {
        Self {
            shared,
            run,
            died: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connected(&self, client: Arc<dyn JobClient>) {
        self.shared.post(ContextEvent::Connected {
            run: self.run,
            client,
        });
    }

    /// The bind could not be established.
    pub fn failed(&self, reason: impl Into<String>) {
        self.shared.post(ContextEvent::BindFailed {
            run: self.run,
            reason: reason.into(),
        });
    }

    /// The executor went away. Only the first report counts.
    pub fn peer_died(&self) {
        if !self.died.swap(true, Ordering::SeqCst) {
            self.shared.post(ContextEvent::Disconnected { run: self.run });
        }
    }
}

impl fmt::Debug for BindSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BindSession")
            .field("context", &self.shared.id)
            .field("run", &self.run)
            .finish()
    }
}

/// Source of wake locks held while a job is starting or executing.
pub trait WakeLockProvider: Send + Sync {
    fn acquire(&self, tag: &str) -> WakeLock;
}

/// A held wake lock. Released explicitly or on drop, once.
pub struct WakeLock {
    tag: String,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl WakeLock {
    pub fn new(tag: impl Into<String>, release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            tag: tag.into(),
            release: Some(Box::new(release)),
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn release(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for WakeLock {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for WakeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeLock").field("tag", &self.tag).finish()
    }
}

/// Wake locks for hosts without power management.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoWakeLocks;

impl WakeLockProvider for NoWakeLocks {
    fn acquire(&self, tag: &str) -> WakeLock {
        WakeLock::new(tag, || {})
    }
}

/// Receives every finished run, exactly once per run.
pub trait CompletionListener: Send + Sync {
    fn on_job_completed(&self, outcome: JobOutcome);
}
