// Test doubles for the executor seams.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use jobhost_core::config::LimitsConfig;
use jobhost_core::{ComponentName, ManualClock, OwnerId};
use jobhost_executor::{
    BindSession, Binding, CompletionListener, ContextDeps, ExecutionError, ExecutorConnector,
    ExecutionTimeouts, JobClient, JobOutcome, JobParameters, WakeLock, WakeLockProvider,
};
use jobhost_store::{JobInfo, JobRecord, Schedule, WorkItem};
use tokio::sync::mpsc;

pub const OWNER: OwnerId = OwnerId(10_001);

pub fn job(job_id: i32) -> Arc<JobRecord> {
    job_with_work(job_id, Vec::new())
}

pub fn job_with_work(job_id: i32, work: Vec<WorkItem>) -> Arc<JobRecord> {
    let mut info = JobInfo::new(
        job_id,
        ComponentName::new("com.example.mail", "com.example.mail.SyncService"),
        Schedule::one_off(),
    );
    info.constraints.requires_charging = true;
    info.work = work;
    Arc::new(JobRecord::from_info(info, OWNER, None, &LimitsConfig::default(), 0).unwrap())
}

pub fn timeouts() -> ExecutionTimeouts {
    ExecutionTimeouts {
        bind: Duration::from_secs(18),
        op: Duration::from_secs(8),
        timeslice: Duration::from_secs(600),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct ChannelClient {
    starts: mpsc::UnboundedSender<JobParameters>,
    stops: mpsc::UnboundedSender<JobParameters>,
}

impl JobClient for ChannelClient {
    fn start_work(&self, params: JobParameters) {
        let _ = self.starts.send(params);
    }

    fn stop_work(&self, params: JobParameters) {
        let _ = self.stops.send(params);
    }
}

// ---------------------------------------------------------------------------
// Connector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindMode {
    /// Connect immediately.
    Connect,
    /// Keep the session for the test to drive.
    Hold,
    /// Refuse to bind.
    Refuse,
}

pub struct MockConnector {
    client: Arc<ChannelClient>,
    mode: Mutex<BindMode>,
    sessions: Mutex<Vec<BindSession>>,
    pub binds: AtomicUsize,
    pub unbinds: Arc<AtomicUsize>,
}

impl MockConnector {
    pub fn set_mode(&self, mode: BindMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn last_session(&self) -> BindSession {
        self.sessions.lock().unwrap().last().cloned().unwrap()
    }

    pub fn client(&self) -> Arc<ChannelClient> {
        self.client.clone()
    }
}

struct MockBinding {
    unbinds: Arc<AtomicUsize>,
}

impl Binding for MockBinding {
    fn unbind(self: Box<Self>) {
        self.unbinds.fetch_add(1, Ordering::SeqCst);
    }
}

impl ExecutorConnector for MockConnector {
    fn bind(
        &self,
        _service: &ComponentName,
        _owner: OwnerId,
        session: BindSession,
    ) -> jobhost_executor::Result<Box<dyn Binding>> {
        self.binds.fetch_add(1, Ordering::SeqCst);
        let mode = *self.mode.lock().unwrap();
        match mode {
            BindMode::Refuse => return Err(ExecutionError::BindFailed("no such service".into())),
            BindMode::Connect => session.connected(self.client.clone()),
            BindMode::Hold => {}
        }
        self.sessions.lock().unwrap().push(session);
        Ok(Box::new(MockBinding {
            unbinds: self.unbinds.clone(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Wake locks / listener
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct CountingWakeLocks {
    pub acquired: AtomicUsize,
    pub released: Arc<AtomicUsize>,
}

impl WakeLockProvider for CountingWakeLocks {
    fn acquire(&self, tag: &str) -> WakeLock {
        self.acquired.fetch_add(1, Ordering::SeqCst);
        let released = self.released.clone();
        WakeLock::new(tag, move || {
            released.fetch_add(1, Ordering::SeqCst);
        })
    }
}

pub struct ChannelListener(mpsc::UnboundedSender<JobOutcome>);

impl CompletionListener for ChannelListener {
    fn on_job_completed(&self, outcome: JobOutcome) {
        let _ = self.0.send(outcome);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub struct Harness {
    pub deps: ContextDeps,
    pub connector: Arc<MockConnector>,
    pub wake_locks: Arc<CountingWakeLocks>,
    pub starts: mpsc::UnboundedReceiver<JobParameters>,
    pub stops: mpsc::UnboundedReceiver<JobParameters>,
    pub outcomes: mpsc::UnboundedReceiver<JobOutcome>,
}

impl Harness {
    pub fn new(mode: BindMode) -> Self {
        Self::with_timeouts(mode, timeouts())
    }

    pub fn with_timeouts(mode: BindMode, timeouts: ExecutionTimeouts) -> Self {
        let (start_tx, starts) = mpsc::unbounded_channel();
        let (stop_tx, stops) = mpsc::unbounded_channel();
        let (outcome_tx, outcomes) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            client: Arc::new(ChannelClient {
                starts: start_tx,
                stops: stop_tx,
            }),
            mode: Mutex::new(mode),
            sessions: Mutex::new(Vec::new()),
            binds: AtomicUsize::new(0),
            unbinds: Arc::new(AtomicUsize::new(0)),
        });
        let wake_locks = Arc::new(CountingWakeLocks::default());
        let deps = ContextDeps::new(connector.clone(), Arc::new(ChannelListener(outcome_tx)))
            .with_wake_locks(wake_locks.clone())
            .with_clock(Arc::new(ManualClock::new(0, 1_700_000_000_000)))
            .with_timeouts(timeouts);
        Self {
            deps,
            connector,
            wake_locks,
            starts,
            stops,
            outcomes,
        }
    }

    pub async fn next_start(&mut self) -> JobParameters {
        self.starts.recv().await.expect("client channel closed")
    }

    pub async fn next_stop(&mut self) -> JobParameters {
        self.stops.recv().await.expect("client channel closed")
    }

    pub async fn next_outcome(&mut self) -> JobOutcome {
        self.outcomes.recv().await.expect("listener channel closed")
    }

    pub fn wake_locks_held(&self) -> usize {
        self.wake_locks.acquired.load(Ordering::SeqCst)
            - self.wake_locks.released.load(Ordering::SeqCst)
    }
}
