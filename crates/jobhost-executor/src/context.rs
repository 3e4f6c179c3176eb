//! Execution contexts: one slot that drives a single job at a time through
//! bind, start, execute and stop.
//!
//! Every context owns a loop task. External triggers (assignment, cancel,
//! bind progress, executor callbacks, timeouts) become [`ContextEvent`]s on
//! that task's channel, so transitions are serialized without holding a lock
//! across calls into the executor. Events carry the run they belong to and
//! are dropped when that run is over.
//!
//! | state      | event                  | next                              |
//! |------------|------------------------|-----------------------------------|
//! | binding    | connected, cancelled   | finished (reschedule)             |
//! | binding    | connected              | starting, `start_work` sent       |
//! | binding    | bind failed / timeout  | finished (reschedule)             |
//! | starting   | ack, more work         | executing (or stopping if cancelled) |
//! | starting   | ack, no more work      | finished                          |
//! | starting   | timeout                | finished (no reschedule)          |
//! | executing  | cancel / timeslice     | stopping, `stop_work` sent        |
//! | stopping   | stop ack               | finished (as acknowledged)        |
//! | stopping   | timeout                | finished (reschedule)             |
//! | any active | executor died          | finished (reschedule)             |

use jobhost_core::{Clock, SystemClock};
use jobhost_store::JobRecord;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::callback::JobCallback;
use crate::client::{
    BindSession, Binding, CompletionListener, ExecutorConnector, JobClient, NoWakeLocks, WakeLock,
    WakeLockProvider,
};
use crate::error::{ExecutionError, Result};
use crate::types::{ContextStatus, ExecutionTimeouts, JobOutcome, JobParameters, StopReason, Verb};
use crate::work::WorkQueue;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

pub(crate) enum ContextEvent {
    Assign { run: u64 },
    Connected { run: u64, client: Arc<dyn JobClient> },
    BindFailed { run: u64, reason: String },
    Disconnected { run: u64 },
    StartAcked { run: u64, has_more_work: bool },
    StopAcked { run: u64, reschedule: bool },
    Finished { run: u64, reschedule: bool },
    Cancel { run: u64, reason: StopReason },
}

impl ContextEvent {
    fn run(&self) -> u64 {
        match self {
            ContextEvent::Assign { run }
            | ContextEvent::Connected { run, .. }
            | ContextEvent::BindFailed { run, .. }
            | ContextEvent::Disconnected { run }
            | ContextEvent::StartAcked { run, .. }
            | ContextEvent::StopAcked { run, .. }
            | ContextEvent::Finished { run, .. }
            | ContextEvent::Cancel { run, .. } => *run,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            ContextEvent::Assign { .. } => "assign",
            ContextEvent::Connected { .. } => "connected",
            ContextEvent::BindFailed { .. } => "bind_failed",
            ContextEvent::Disconnected { .. } => "disconnected",
            ContextEvent::StartAcked { .. } => "start_acked",
            ContextEvent::StopAcked { .. } => "stop_acked",
            ContextEvent::Finished { .. } => "finished",
            ContextEvent::Cancel { .. } => "cancel",
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// The part of a run visible to handles and callbacks.
#[derive(Debug)]
pub(crate) struct Slot {
    pub(crate) job: Option<Arc<JobRecord>>,
    pub(crate) run: u64,
    pub(crate) verb: Verb,
    pub(crate) work: WorkQueue,
}

pub(crate) struct Shared {
    pub(crate) id: usize,
    slot: Mutex<Slot>,
    events: mpsc::UnboundedSender<ContextEvent>,
    status: watch::Sender<ContextStatus>,
}

impl Shared {
    pub(crate) fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().expect("execution slot lock poisoned")
    }

    pub(crate) fn post(&self, event: ContextEvent) {
        if self.events.send(event).is_err() {
            warn!(context = self.id, "context loop is gone; event dropped");
        }
    }
}

// ---------------------------------------------------------------------------
// ContextDeps
// ---------------------------------------------------------------------------

/// Collaborators every context needs.
#[derive(Clone)]
pub struct ContextDeps {
    connector: Arc<dyn ExecutorConnector>,
    listener: Arc<dyn CompletionListener>,
    wake_locks: Arc<dyn WakeLockProvider>,
    clock: Arc<dyn Clock>,
    timeouts: ExecutionTimeouts,
}

impl ContextDeps {
    pub fn new(connector: Arc<dyn ExecutorConnector>, listener: Arc<dyn CompletionListener>) -> Self {
        Self {
            connector,
            listener,
            wake_locks: Arc::new(NoWakeLocks),
            clock: Arc::new(SystemClock::new()),
            timeouts: ExecutionTimeouts::default(),
        }
    }

    pub fn with_wake_locks(mut self, wake_locks: Arc<dyn WakeLockProvider>) -> Self {
        self.wake_locks = wake_locks;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_timeouts(mut self, timeouts: ExecutionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn timeouts(&self) -> ExecutionTimeouts {
        self.timeouts
    }
}

// ---------------------------------------------------------------------------
// ExecutionContext
// ---------------------------------------------------------------------------

/// Cheap-to-clone handle to one execution slot.
#[derive(Clone)]
pub struct ExecutionContext {
    shared: Arc<Shared>,
}

impl ExecutionContext {
    /// Create the slot and start its loop task. Must be called from within
    /// a tokio runtime.
    pub fn spawn(id: usize, deps: ContextDeps) -> Self {
        let (events, rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(ContextStatus::idle());
        let shared = Arc::new(Shared {
            id,
            slot: Mutex::new(Slot {
                job: None,
                run: 0,
                verb: Verb::Finished,
                work: WorkQueue::default(),
            }),
            events,
            status,
        });
        let driver = ContextLoop {
            shared: shared.clone(),
            rx,
            deps,
            run: 0,
            job: None,
            cancelled: None,
            client: None,
            binding: None,
            wake_lock: None,
            params: None,
            timeout: None,
            started_at: None,
        };
        tokio::spawn(driver.run());
        Self { shared }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn is_available(&self) -> bool {
        self.shared.lock_slot().job.is_none()
    }

    pub fn running_job(&self) -> Option<Arc<JobRecord>> {
        self.shared.lock_slot().job.clone()
    }

    pub fn status(&self) -> ContextStatus {
        self.shared.status.borrow().clone()
    }

    /// Receives a new status after every transition.
    pub fn subscribe(&self) -> watch::Receiver<ContextStatus> {
        self.shared.status.subscribe()
    }

    /// Hand `job` to this context. Fails without side effects if the context
    /// is already running something.
    pub fn assign(&self, job: Arc<JobRecord>) -> Result<()> {
        let mut slot = self.shared.lock_slot();
        if slot.job.is_some() {
            return Err(ExecutionError::ContextBusy {
                context: self.shared.id,
            });
        }
        slot.run += 1;
        slot.verb = Verb::Binding;
        slot.work = WorkQueue::load(job.pending_work());
        slot.job = Some(job);
        // posted under the lock so later events for this run queue behind it
        self.shared.post(ContextEvent::Assign { run: slot.run });
        Ok(())
    }

    /// Ask the running job to stop. Returns false when the context is idle.
    pub fn cancel(&self, reason: StopReason) -> bool {
        let slot = self.shared.lock_slot();
        if slot.job.is_none() {
            warn!(context = self.shared.id, %reason, "cancel on idle context ignored");
            return false;
        }
        self.shared.post(ContextEvent::Cancel {
            run: slot.run,
            reason,
        });
        true
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.shared.id)
            .field("status", &self.status())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ContextLoop
// ---------------------------------------------------------------------------

struct ContextLoop {
    shared: Arc<Shared>,
    rx: mpsc::UnboundedReceiver<ContextEvent>,
    deps: ContextDeps,
    /// Run currently driven; events for any other run are stale.
    run: u64,
    job: Option<Arc<JobRecord>>,
    cancelled: Option<StopReason>,
    client: Option<Arc<dyn JobClient>>,
    binding: Option<Box<dyn Binding>>,
    wake_lock: Option<WakeLock>,
    params: Option<JobParameters>,
    /// At most one pending timeout; re-armed on every transition.
    timeout: Option<Instant>,
    started_at: Option<Instant>,
}

impl ContextLoop {
    async fn run(mut self) {
        debug!(context = self.shared.id, "execution context started");
        loop {
            let deadline = self.timeout;
            tokio::select! {
                event = self.rx.recv() => match event {
                    Some(event) => self.handle(event),
                    None => break,
                },
                _ = sleep_until(deadline) => {
                    self.timeout = None;
                    self.on_timeout();
                }
            }
        }
        debug!(context = self.shared.id, "execution context stopped");
    }

    fn handle(&mut self, event: ContextEvent) {
        if let ContextEvent::Assign { run } = event {
            self.on_assign(run);
            return;
        }
        if event.run() != self.run {
            debug!(
                context = self.shared.id,
                event = event.name(),
                run = event.run(),
                current = self.run,
                "stale event ignored"
            );
            return;
        }
        match event {
            ContextEvent::Assign { .. } => {}
            ContextEvent::Connected { client, .. } => self.on_connected(client),
            ContextEvent::BindFailed { reason, .. } => {
                if self.verb() == Verb::Binding {
                    warn!(context = self.shared.id, %reason, "bind failed");
                    self.close(true, "bind failed");
                }
            }
            ContextEvent::Disconnected { .. } => {
                if self.verb() != Verb::Finished {
                    warn!(context = self.shared.id, verb = %self.verb(), "executor died");
                    self.close(true, "executor died");
                }
            }
            ContextEvent::StartAcked { has_more_work, .. } => self.on_start_acked(has_more_work),
            ContextEvent::StopAcked { reschedule, .. } => self.on_stop_acked(reschedule),
            ContextEvent::Finished { reschedule, .. } => self.on_finished(reschedule),
            ContextEvent::Cancel { reason, .. } => self.on_cancel(reason),
        }
    }

    fn on_assign(&mut self, run: u64) {
        let job = {
            let slot = self.shared.lock_slot();
            match &slot.job {
                Some(job) if slot.run == run => job.clone(),
                _ => {
                    debug!(context = self.shared.id, run, "assignment already withdrawn");
                    return;
                }
            }
        };
        if let Some(stale) = self.wake_lock.take() {
            warn!(context = self.shared.id, tag = stale.tag(), "releasing wake lock left by previous run");
            stale.release();
        }
        self.run = run;
        self.job = Some(job.clone());
        self.cancelled = None;
        self.client = None;
        self.params = None;
        self.started_at = None;
        self.publish();

        info!(context = self.shared.id, job = %job.key(), service = %job.service(), "binding to executor");
        let session = BindSession::new(self.shared.clone(), run);
        match self.deps.connector.bind(job.service(), job.owner(), session) {
            Ok(binding) => {
                self.binding = Some(binding);
                self.arm(self.deps.timeouts.bind);
            }
            Err(e) => {
                warn!(context = self.shared.id, job = %job.key(), error = %e, "bind refused");
                self.close(true, "bind refused");
            }
        }
    }

    fn on_connected(&mut self, client: Arc<dyn JobClient>) {
        let verb = self.verb();
        if verb != Verb::Binding {
            warn!(context = self.shared.id, %verb, "unexpected connection ignored");
            return;
        }
        if let Some(reason) = self.cancelled {
            debug!(context = self.shared.id, %reason, "cancelled while binding");
            self.close(true, "cancelled while binding");
            return;
        }
        let Some(job) = self.job.clone() else {
            return;
        };

        if let Some(stale) = self.wake_lock.take() {
            warn!(context = self.shared.id, tag = stale.tag(), "releasing unexpected wake lock");
            stale.release();
        }
        let tag = format!("*job*/{}", job.service().flatten_short());
        self.wake_lock = Some(self.deps.wake_locks.acquire(&tag));

        let now = self.deps.clock.elapsed_millis();
        let params = JobParameters {
            job_id: job.job_id(),
            extras: job.extras().clone(),
            deadline_expired: job.latest_run_elapsed().is_some_and(|latest| latest <= now),
            stop_reason: None,
            callback: JobCallback::new(self.shared.clone(), self.run),
        };
        self.client = Some(client.clone());
        self.params = Some(params.clone());
        self.started_at = Some(Instant::now());
        self.set_verb(Verb::Starting);
        self.arm(self.deps.timeouts.op);
        debug!(context = self.shared.id, job = %job.key(), "start_work sent");
        client.start_work(params);
    }

    fn on_start_acked(&mut self, has_more_work: bool) {
        let verb = self.verb();
        if verb != Verb::Starting {
            warn!(context = self.shared.id, %verb, "start acknowledgement ignored");
            return;
        }
        if !has_more_work {
            self.close(false, "nothing to do");
            return;
        }
        self.set_verb(Verb::Executing);
        match self.cancelled {
            Some(reason) => self.send_stop(reason),
            None => self.arm(self.deps.timeouts.timeslice),
        }
    }

    fn on_stop_acked(&mut self, reschedule: bool) {
        let verb = self.verb();
        if verb != Verb::Stopping {
            warn!(context = self.shared.id, %verb, "stop acknowledgement ignored");
            return;
        }
        self.close(reschedule, "stopped");
    }

    fn on_finished(&mut self, reschedule: bool) {
        match self.verb() {
            Verb::Starting | Verb::Executing | Verb::Stopping => self.close(reschedule, "finished"),
            verb => warn!(context = self.shared.id, %verb, "finish report ignored"),
        }
    }

    fn on_cancel(&mut self, reason: StopReason) {
        match self.verb() {
            Verb::Binding | Verb::Starting => {
                // honoured once the start handshake completes
                if self.cancelled.is_none() {
                    debug!(context = self.shared.id, %reason, "cancel deferred");
                    self.cancelled = Some(reason);
                    self.publish();
                }
            }
            Verb::Executing => {
                self.cancelled = Some(reason);
                self.send_stop(reason);
            }
            Verb::Stopping => {
                debug!(context = self.shared.id, %reason, "already stopping");
            }
            Verb::Finished => {
                warn!(context = self.shared.id, %reason, "cancel for finished run ignored");
            }
        }
    }

    fn on_timeout(&mut self) {
        let verb = self.verb();
        let key = self.job.as_ref().map(|j| j.key());
        match verb {
            Verb::Binding => {
                warn!(context = self.shared.id, job = ?key, "timed out binding");
                self.close(true, "bind timeout");
            }
            Verb::Starting => {
                warn!(context = self.shared.id, job = ?key, "no start acknowledgement");
                self.close(false, "start timeout");
            }
            Verb::Executing => {
                info!(context = self.shared.id, job = ?key, "timeslice exhausted");
                self.cancelled = Some(StopReason::Timeout);
                self.send_stop(StopReason::Timeout);
            }
            Verb::Stopping => {
                warn!(context = self.shared.id, job = ?key, "no stop acknowledgement");
                self.close(true, "stop timeout");
            }
            Verb::Finished => {}
        }
    }

    fn send_stop(&mut self, reason: StopReason) {
        let Some(client) = self.client.clone() else {
            self.close(true, "no client to stop");
            return;
        };
        let params = match self.params.as_mut() {
            Some(params) => {
                params.stop_reason = Some(reason);
                params.clone()
            }
            None => {
                self.close(true, "no client to stop");
                return;
            }
        };
        self.set_verb(Verb::Stopping);
        self.arm(self.deps.timeouts.op);
        debug!(context = self.shared.id, %reason, "stop_work sent");
        client.stop_work(params);
    }

    /// End the run: release everything, free the slot, report the outcome.
    fn close(&mut self, needs_reschedule: bool, why: &'static str) {
        self.timeout = None;
        if let Some(lock) = self.wake_lock.take() {
            lock.release();
        }
        if let Some(binding) = self.binding.take() {
            binding.unbind();
        }
        self.client = None;
        self.params = None;
        let ran_for = self.started_at.take().map(|t| t.elapsed());
        let stop_reason = self.cancelled.take();
        self.job = None;
        // run ids start at 1, so late events for the ended run are now stale
        self.run = 0;

        let (job, unfinished_work) = {
            let mut slot = self.shared.lock_slot();
            slot.verb = Verb::Finished;
            (slot.job.take(), slot.work.drain_unfinished())
        };
        self.publish();

        let Some(job) = job else {
            return;
        };
        info!(
            context = self.shared.id,
            job = %job.key(),
            needs_reschedule,
            stop_reason = ?stop_reason,
            ran_for_ms = ran_for.map(|d| d.as_millis() as u64),
            why,
            "job run ended"
        );
        self.deps.listener.on_job_completed(JobOutcome {
            job,
            needs_reschedule,
            stop_reason,
            unfinished_work,
        });
    }

    fn arm(&mut self, after: Duration) {
        self.timeout = Some(Instant::now() + after);
    }

    fn verb(&self) -> Verb {
        self.shared.lock_slot().verb
    }

    fn set_verb(&mut self, verb: Verb) {
        self.shared.lock_slot().verb = verb;
        self.publish();
    }

    fn publish(&self) {
        let status = {
            let slot = self.shared.lock_slot();
            ContextStatus {
                verb: slot.verb,
                job: slot.job.as_ref().map(|j| j.key()),
                cancelled: self.cancelled.is_some(),
            }
        };
        self.shared.status.send_replace(status);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
