//! `jobhost-executor`: execution contexts that run one job at a time
//! against an external executor component.
//!
//! A context binds to the job's executor, sends `start_work`, waits for
//! acknowledgements under per-phase timeouts, and reports exactly one
//! [`JobOutcome`] per run to its [`CompletionListener`].
//!
//! | phase     | timeout          | on expiry                       |
//! |-----------|------------------|---------------------------------|
//! | binding   | bind (18 s)      | finished, rescheduled           |
//! | starting  | op (8 s)         | finished, not rescheduled       |
//! | executing | timeslice (10 m) | stop requested                  |
//! | stopping  | op (8 s)         | finished, rescheduled           |

pub mod callback;
pub mod client;
pub mod completion;
pub mod context;
pub mod error;
pub mod pool;
pub mod types;
mod work;

pub use callback::JobCallback;
pub use client::{
    BindSession, Binding, CompletionListener, ExecutorConnector, JobClient, NoWakeLocks, WakeLock,
    WakeLockProvider,
};
pub use completion::StoreCompletionHandler;
pub use context::{ContextDeps, ExecutionContext};
pub use error::{ExecutionError, Result};
pub use pool::ContextPool;
pub use types::{ContextStatus, ExecutionTimeouts, JobOutcome, JobParameters, StopReason, Verb};
