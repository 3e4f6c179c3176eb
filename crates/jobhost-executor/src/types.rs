//! Shared data types for jobhost-executor.

use jobhost_core::config::ExecutionConfig;
use jobhost_core::{JobId, JobKey};
use jobhost_store::{JobRecord, WorkItem};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::callback::JobCallback;

// ---------------------------------------------------------------------------
// Verb
// ---------------------------------------------------------------------------

/// Phase of the per-context state machine.
///
/// `Finished` doubles as "available": a finished context is immediately
/// reusable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Binding,
    Starting,
    Executing,
    Stopping,
    Finished,
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verb::Binding => "binding",
            Verb::Starting => "starting",
            Verb::Executing => "executing",
            Verb::Stopping => "stopping",
            Verb::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// StopReason
// ---------------------------------------------------------------------------

/// Why the host asked a running job to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopReason {
    /// Cancelled by the owner or the scheduler.
    Cancelled,
    /// A required constraint stopped holding.
    ConstraintsUnsatisfied,
    /// Slot reclaimed for higher-priority work.
    Preempted,
    /// Execution timeslice exhausted.
    Timeout,
    /// The owning principal went away.
    OwnerRemoved,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Cancelled => "cancelled",
            StopReason::ConstraintsUnsatisfied => "constraints",
            StopReason::Preempted => "preempt",
            StopReason::Timeout => "timeout",
            StopReason::OwnerRemoved => "owner_removed",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// ExecutionTimeouts
// ---------------------------------------------------------------------------

/// Per-phase deadlines: bind ≫ acknowledgement ≪ timeslice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTimeouts {
    /// Waiting for the executor component to connect.
    pub bind: Duration,
    /// Waiting for a start or stop acknowledgement.
    pub op: Duration,
    /// How long a job may execute before it is asked to stop.
    pub timeslice: Duration,
}

impl From<&ExecutionConfig> for ExecutionTimeouts {
    fn from(config: &ExecutionConfig) -> Self {
        Self {
            bind: config.bind_timeout(),
            op: config.op_timeout(),
            timeslice: config.timeslice(),
        }
    }
}

impl Default for ExecutionTimeouts {
    fn default() -> Self {
        Self::from(&ExecutionConfig::default())
    }
}

// ---------------------------------------------------------------------------
// ContextStatus
// ---------------------------------------------------------------------------

/// Snapshot published after every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextStatus {
    pub verb: Verb,
    pub job: Option<JobKey>,
    pub cancelled: bool,
}

impl ContextStatus {
    pub(crate) fn idle() -> Self {
        Self {
            verb: Verb::Finished,
            job: None,
            cancelled: false,
        }
    }
}

// ---------------------------------------------------------------------------
// JobParameters / JobOutcome
// ---------------------------------------------------------------------------

/// What the executor receives with `start_work` / `stop_work`.
#[derive(Debug, Clone)]
pub struct JobParameters {
    pub job_id: JobId,
    pub extras: serde_json::Map<String, serde_json::Value>,
    /// The job's deadline had already passed when it was started.
    pub deadline_expired: bool,
    /// Set on `stop_work`.
    pub stop_reason: Option<StopReason>,
    /// Reply channel for this run only.
    pub callback: JobCallback,
}

/// Reported to the completion listener when a run ends.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub job: Arc<JobRecord>,
    pub needs_reschedule: bool,
    /// Set when the host stopped or cancelled the run.
    pub stop_reason: Option<StopReason>,
    /// Work items dequeued but not completed, followed by those never
    /// dequeued.
    pub unfinished_work: Vec<WorkItem>,
}
