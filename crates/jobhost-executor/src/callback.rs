//! The handle an executor uses to talk back to the host.

use jobhost_core::OwnerId;
use jobhost_store::WorkItem;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::context::{ContextEvent, Shared, Slot};
use crate::error::{ExecutionError, Result};
use crate::types::Verb;

/// Reply channel handed to the executor with each run's parameters.
///
/// Every call names the calling principal, which must own the running job.
/// Calls made with a callback from an earlier run are logged and ignored.
#[derive(Clone)]
pub struct JobCallback {
    shared: Arc<Shared>,
    run: u64,
}

impl JobCallback {
    pub(crate) fn new(shared: Arc<Shared>, run: u64) -> Self {
        Self { shared, run }
    }

    /// Answer to `start_work`. `has_more_work = false` ends the run.
    pub fn acknowledge_start(&self, caller: OwnerId, has_more_work: bool) -> Result<()> {
        if self.verify(caller, "acknowledge_start")? {
            self.shared.post(ContextEvent::StartAcked {
                run: self.run,
                has_more_work,
            });
        }
        Ok(())
    }

    /// Answer to `stop_work`.
    pub fn acknowledge_stop(&self, caller: OwnerId, reschedule: bool) -> Result<()> {
        if self.verify(caller, "acknowledge_stop")? {
            self.shared.post(ContextEvent::StopAcked {
                run: self.run,
                reschedule,
            });
        }
        Ok(())
    }

    /// The job finished on its own.
    pub fn job_finished(&self, caller: OwnerId, reschedule: bool) -> Result<()> {
        if self.verify(caller, "job_finished")? {
            self.shared.post(ContextEvent::Finished {
                run: self.run,
                reschedule,
            });
        }
        Ok(())
    }

    /// Next work item, or `None`.
    ///
    /// When nothing is pending and nothing is outstanding the run is
    /// finished without a reschedule.
    pub fn dequeue_work(&self, caller: OwnerId) -> Result<Option<WorkItem>> {
        let mut slot = self.shared.lock_slot();
        if !self.check(&slot, caller, "dequeue_work")? {
            return Ok(None);
        }
        if matches!(slot.verb, Verb::Stopping | Verb::Finished) {
            return Ok(None);
        }
        if let Some(item) = slot.work.dequeue() {
            debug!(context = self.shared.id, work_id = item.id, "work item delivered");
            return Ok(Some(item));
        }
        if !slot.work.has_executing() {
            debug!(context = self.shared.id, "work queue drained, finishing run");
            self.shared.post(ContextEvent::Finished {
                run: self.run,
                reschedule: false,
            });
        }
        Ok(None)
    }

    /// Mark a delivered item done. Returns false for unknown ids.
    pub fn complete_work(&self, caller: OwnerId, work_id: u32) -> Result<bool> {
        let mut slot = self.shared.lock_slot();
        if !self.check(&slot, caller, "complete_work")? {
            return Ok(false);
        }
        Ok(slot.work.complete(work_id))
    }

    fn verify(&self, caller: OwnerId, op: &'static str) -> Result<bool> {
        let slot = self.shared.lock_slot();
        self.check(&slot, caller, op)
    }

    /// `Ok(false)` means "stale, ignore".
    fn check(&self, slot: &Slot, caller: OwnerId, op: &'static str) -> Result<bool> {
        let Some(job) = slot.job.as_ref() else {
            warn!(context = self.shared.id, run = self.run, op, "callback on idle context ignored");
            return Ok(false);
        };
        if job.owner() != caller {
            warn!(
                context = self.shared.id,
                job = %job.key(),
                %caller,
                op,
                "callback from foreign principal rejected"
            );
            return Err(ExecutionError::SecurityViolation {
                caller,
                owner: job.owner(),
            });
        }
        if slot.run != self.run {
            warn!(
                context = self.shared.id,
                run = self.run,
                current = slot.run,
                op,
                "callback from a previous run ignored"
            );
            return Ok(false);
        }
        Ok(true)
    }
}

impl fmt::Debug for JobCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCallback")
            .field("context", &self.shared.id)
            .field("run", &self.run)
            .finish()
    }
}
