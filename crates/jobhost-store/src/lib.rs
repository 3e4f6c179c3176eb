//! `jobhost-store`: the authoritative set of scheduled jobs.
//!
//! # Overview
//!
//! [`JobStore`] keeps every known [`JobRecord`] in an owner-partitioned
//! index behind a single mutex. Records flagged as persisted are mirrored to
//! a JSON snapshot by a dedicated I/O thread: each qualifying mutation queues
//! a full rewrite, the worker copies record references under the lock and
//! does the encoding and the atomic file replacement without it.
//!
//! # Boot
//!
//! [`JobStore::open`] loads the snapshot synchronously. If the file looks
//! newer than the wall clock, the clock is treated as untrusted: loaded jobs
//! keep their wall-clock bounds until [`JobStore::on_wall_clock_validated`]
//! re-derives them.
//!
//! | Snapshot problem          | Effect                              |
//! |---------------------------|-------------------------------------|
//! | missing file              | empty store                         |
//! | version mismatch          | whole file ignored, empty store     |
//! | one malformed job element | that job skipped, rest loaded       |
//! | write failure             | logged, retried on next mutation    |

pub mod error;
pub mod record;
pub mod snapshot;
pub mod store;
mod writer;

pub use error::{Result, StoreError};
pub use record::{
    BackoffKind, BackoffPolicy, Constraint, Constraints, JobInfo, JobRecord, JobSource,
    NetworkType, Schedule, WallClockBounds, WorkItem,
};
pub use snapshot::LoadReport;
pub use store::{JobStore, StoreListener};
