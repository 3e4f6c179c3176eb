//! `jobhost-core`: identity types, clocks and configuration shared by the
//! job store and the execution contexts.

pub mod clock;
pub mod config;
pub mod error;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::JobHostConfig;
pub use error::{CoreError, Result};
pub use types::{ComponentName, GroupId, JobId, JobKey, OwnerId};
