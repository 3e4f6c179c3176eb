//! Durable snapshot of the persisted jobs.
//!
//! The snapshot is a single versioned JSON document, always rewritten in
//! full:
//!
//! ```json
//! { "version": 0,
//!   "jobs": [ { "job_id": 7, "owner": 10001, "package": "…", "class": "…",
//!               "constraints": { "charging": true },
//!               "execution": { "one_off": { "delay": 1700000000000 } },
//!               "backoff": { "initial": 30000, "policy": "exponential" },
//!               "extras": { … } } ] }
//! ```
//!
//! Timing is stored as wall-clock milliseconds; the elapsed base does not
//! survive a reboot.

use jobhost_core::clock::Clock;
use jobhost_core::config::SNAPSHOT_VERSION;
use jobhost_core::{ComponentName, GroupId, JobId, JobKey, OwnerId};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::record::{
    millis, next_instance, BackoffKind, BackoffPolicy, Constraint, Constraints, JobRecord,
    JobSource, NetworkType, Schedule, WallClockBounds,
};

#[derive(Serialize)]
struct SnapshotDocument {
    version: u32,
    jobs: Vec<PersistedJob>,
}

/// Decoded lazily so one bad job element cannot sink the whole document.
#[derive(Deserialize)]
struct RawDocument {
    #[serde(default)]
    version: Option<serde_json::Value>,
    #[serde(default)]
    jobs: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedJob {
    job_id: i32,
    owner: u32,
    package: String,
    class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_package: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_group: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source_tag: Option<String>,
    #[serde(default)]
    priority: i32,
    #[serde(default)]
    flags: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_successful_run: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_failed_run: Option<i64>,
    #[serde(default)]
    constraints: PersistedConstraints,
    execution: PersistedExecution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    backoff: Option<PersistedBackoff>,
    #[serde(default)]
    extras: serde_json::Map<String, serde_json::Value>,
}

/// Flags are written only when set.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedConstraints {
    #[serde(default, skip_serializing_if = "is_false")]
    connectivity: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    unmetered: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    not_roaming: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    metered: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    charging: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    battery_not_low: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    storage_not_low: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    idle: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

/// Wall-clock `delay` (earliest) and `deadline` (latest) bounds.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum PersistedExecution {
    Periodic {
        period: u64,
        flex: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<i64>,
    },
    OneOff {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deadline: Option<i64>,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedBackoff {
    initial: u64,
    policy: BackoffKind,
}

impl From<&Constraints> for PersistedConstraints {
    fn from(c: &Constraints) -> Self {
        Self {
            connectivity: c.network == Some(NetworkType::Any),
            unmetered: c.network == Some(NetworkType::Unmetered),
            not_roaming: c.network == Some(NetworkType::NotRoaming),
            metered: c.network == Some(NetworkType::Metered),
            charging: c.requires_charging,
            battery_not_low: c.requires_battery_not_low,
            storage_not_low: c.requires_storage_not_low,
            idle: c.requires_device_idle,
        }
    }
}

impl From<PersistedConstraints> for Constraints {
    fn from(p: PersistedConstraints) -> Self {
        // most specific network wins if several were written
        let network = if p.unmetered {
            Some(NetworkType::Unmetered)
        } else if p.not_roaming {
            Some(NetworkType::NotRoaming)
        } else if p.metered {
            Some(NetworkType::Metered)
        } else if p.connectivity {
            Some(NetworkType::Any)
        } else {
            None
        };
        Self {
            network,
            requires_charging: p.charging,
            requires_battery_not_low: p.battery_not_low,
            requires_storage_not_low: p.storage_not_low,
            requires_device_idle: p.idle,
        }
    }
}

impl PersistedJob {
    fn from_record(job: &JobRecord, now_elapsed: i64, now_wall: i64) -> Self {
        let bounds = job.to_wall_clock_bounds(now_elapsed, now_wall);
        let execution = match job.schedule {
            Schedule::Periodic { period, flex } => PersistedExecution::Periodic {
                period: millis(period) as u64,
                flex: millis(flex) as u64,
                delay: bounds.earliest,
                deadline: bounds.latest,
            },
            Schedule::OneOff { .. } => PersistedExecution::OneOff {
                delay: bounds.earliest,
                deadline: bounds.latest,
            },
        };
        let backoff = (job.backoff != BackoffPolicy::default()).then(|| PersistedBackoff {
            initial: millis(job.backoff.initial) as u64,
            policy: job.backoff.kind,
        });
        Self {
            job_id: job.key.job_id.0,
            owner: job.key.owner.0,
            package: job.service.package.clone(),
            class: job.service.class.clone(),
            source_package: Some(job.source.package.clone()),
            source_group: Some(job.source.group.0),
            source_tag: job.source.tag.clone(),
            priority: job.priority,
            flags: job.flags,
            last_successful_run: job.last_successful_run,
            last_failed_run: job.last_failed_run,
            constraints: PersistedConstraints::from(&job.constraints),
            execution,
            backoff,
            extras: job.extras.clone(),
        }
    }

    /// Rebuild a record on the current elapsed base.
    ///
    /// With an untrusted wall clock the raw wall-clock bounds are retained on
    /// the record so a later correction pass can redo the conversion.
    fn into_record(self, now_elapsed: i64, now_wall: i64, rtc_good: bool) -> Result<JobRecord> {
        if self.package.is_empty() || self.class.is_empty() {
            return Err(StoreError::InvalidJob("empty service component".to_string()));
        }
        let owner = OwnerId(self.owner);
        let (schedule, wall) = match self.execution {
            PersistedExecution::Periodic {
                period,
                flex,
                delay,
                deadline,
            } => {
                if period == 0 || flex > period || period > i64::MAX as u64 {
                    return Err(StoreError::InvalidJob(format!(
                        "bad periodic window: period={period} flex={flex}"
                    )));
                }
                let schedule = Schedule::Periodic {
                    period: Duration::from_millis(period),
                    flex: Duration::from_millis(flex),
                };
                (schedule, WallClockBounds { earliest: delay, latest: deadline })
            }
            PersistedExecution::OneOff { delay, deadline } => (
                Schedule::one_off(),
                WallClockBounds { earliest: delay, latest: deadline },
            ),
        };

        let (mut earliest, mut latest) = wall.to_elapsed(now_elapsed, now_wall)?;
        if let Schedule::Periodic { period, flex } = schedule {
            let (period, flex) = (millis(period), millis(flex));
            let max_latest = now_elapsed
                .checked_add(period)
                .and_then(|t| t.checked_add(flex))
                .ok_or_else(|| {
                    StoreError::InvalidJob(format!(
                        "periodic window out of range: period={period} flex={flex}"
                    ))
                })?;
            if latest.is_some_and(|l| l > max_latest) {
                warn!(
                    owner = self.owner,
                    job_id = self.job_id,
                    "periodic job window too far out, clamping"
                );
                earliest = Some(now_elapsed + flex);
                latest = Some(max_latest);
            }
        }

        let backoff = match self.backoff {
            Some(b) => BackoffPolicy {
                initial: Duration::from_millis(b.initial),
                kind: b.policy,
            },
            None => BackoffPolicy::default(),
        };
        let source = JobSource {
            package: self.source_package.unwrap_or_else(|| self.package.clone()),
            group: self.source_group.map(GroupId).unwrap_or_else(|| owner.group()),
            tag: self.source_tag,
        };
        let record = JobRecord {
            instance: next_instance(),
            key: JobKey::new(owner, JobId(self.job_id)),
            service: ComponentName::new(self.package, self.class),
            source,
            constraints: self.constraints.into(),
            schedule,
            backoff,
            earliest_run_elapsed: earliest,
            latest_run_elapsed: latest,
            wall_clock_bounds: (!rtc_good).then_some(wall),
            num_failures: 0,
            last_successful_run: self.last_successful_run,
            last_failed_run: self.last_failed_run,
            persisted: true,
            extras: self.extras,
            priority: self.priority,
            flags: self.flags,
            pending_work: Vec::new(),
            required: 0,
            satisfied: Constraint::AppNotIdle.bit(),
        };
        Ok(record.with_derived_requirements())
    }
}

/// Serialise the persisted subset of the store.
pub fn encode(jobs: &[Arc<JobRecord>], now_elapsed: i64, now_wall: i64) -> Result<Vec<u8>> {
    let doc = SnapshotDocument {
        version: SNAPSHOT_VERSION,
        jobs: jobs
            .iter()
            .filter(|j| j.persisted)
            .map(|j| PersistedJob::from_record(j, now_elapsed, now_wall))
            .collect(),
    };
    Ok(serde_json::to_vec_pretty(&doc)?)
}

/// Jobs recovered from a snapshot plus how many elements were dropped.
#[derive(Debug, Default)]
pub struct DecodedJobs {
    pub jobs: Vec<JobRecord>,
    pub skipped: usize,
}

/// Parse a snapshot document.
///
/// A version mismatch fails the whole decode; a malformed job element is
/// logged and skipped.
pub fn decode(bytes: &[u8], now_elapsed: i64, now_wall: i64, rtc_good: bool) -> Result<DecodedJobs> {
    let raw: RawDocument = serde_json::from_slice(bytes)?;
    let version = raw.version.as_ref().and_then(serde_json::Value::as_u64);
    if version != Some(SNAPSHOT_VERSION as u64) {
        return Err(StoreError::VersionMismatch {
            found: version.unwrap_or(u64::MAX),
            expected: SNAPSHOT_VERSION,
        });
    }

    let mut decoded = DecodedJobs::default();
    for (index, element) in raw.jobs.into_iter().enumerate() {
        let parsed = serde_json::from_value::<PersistedJob>(element)
            .map_err(StoreError::from)
            .and_then(|p| p.into_record(now_elapsed, now_wall, rtc_good));
        match parsed {
            Ok(job) => decoded.jobs.push(job),
            Err(e) => {
                warn!(index, error = %e, "skipping malformed job in snapshot");
                decoded.skipped += 1;
            }
        }
    }
    Ok(decoded)
}

/// Outcome of the boot-time load.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub jobs: Vec<JobRecord>,
    pub skipped: usize,
    /// False when the snapshot's mtime lies in the future.
    pub rtc_good: bool,
    /// Snapshot mtime, wall-clock millis; `None` when there was no file.
    pub file_timestamp: Option<i64>,
    /// Why the whole document was thrown away, if it was.
    pub discarded: Option<String>,
}

/// Read the snapshot at `path`. Never fails: anything unreadable yields an
/// empty report with `discarded` set.
pub fn load(path: &Path, clock: &dyn Clock) -> LoadReport {
    let now_wall = clock.wall_millis();
    let now_elapsed = clock.elapsed_millis();

    let file_timestamp = match std::fs::metadata(path) {
        Ok(meta) => meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no job snapshot yet");
            return LoadReport {
                rtc_good: true,
                ..Default::default()
            };
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "job snapshot unreadable");
            return LoadReport {
                rtc_good: true,
                discarded: Some(e.to_string()),
                ..Default::default()
            };
        }
    };
    let rtc_good = file_timestamp.map_or(true, |ts| ts <= now_wall);
    if !rtc_good {
        warn!(
            file_timestamp,
            now_wall, "snapshot is newer than the wall clock; keeping wall-clock bounds"
        );
    }

    let mut report = LoadReport {
        rtc_good,
        file_timestamp,
        ..Default::default()
    };
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "job snapshot unreadable");
            report.discarded = Some(e.to_string());
            return report;
        }
    };
    match decode(&bytes, now_elapsed, now_wall, rtc_good) {
        Ok(decoded) => {
            info!(
                loaded = decoded.jobs.len(),
                skipped = decoded.skipped,
                "job snapshot loaded"
            );
            report.jobs = decoded.jobs;
            report.skipped = decoded.skipped;
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "discarding job snapshot");
            report.discarded = Some(e.to_string());
        }
    }
    report
}

/// Replace `path` atomically: write a sibling temp file, sync, rename.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)?;
    Ok(())
}
