//! Job descriptions and the records the store keeps for them.
//!
//! A [`JobRecord`] is treated as an immutable value: identity and timing
//! never change in place. Rescheduling, clock correction and work re-queueing
//! all build a *new* record which replaces the old one in the store.

use jobhost_core::clock::Clock;
use jobhost_core::config::LimitsConfig;
use jobhost_core::{ComponentName, GroupId, JobId, JobKey, OwnerId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::error::{Result, StoreError};

pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(30);
pub const MIN_INITIAL_BACKOFF: Duration = Duration::from_secs(10);

/// Kind of network a job needs before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkType {
    Any,
    Unmetered,
    NotRoaming,
    Metered,
}

/// Environmental requirements declared by the submitting client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default)]
    pub network: Option<NetworkType>,
    #[serde(default)]
    pub requires_charging: bool,
    #[serde(default)]
    pub requires_battery_not_low: bool,
    #[serde(default)]
    pub requires_storage_not_low: bool,
    #[serde(default)]
    pub requires_device_idle: bool,
}

impl Constraints {
    fn required_mask(&self) -> u32 {
        let mut mask = 0;
        if self.requires_charging {
            mask |= Constraint::Charging.bit();
        }
        if self.requires_battery_not_low {
            mask |= Constraint::BatteryNotLow.bit();
        }
        if self.requires_storage_not_low {
            mask |= Constraint::StorageNotLow.bit();
        }
        if self.requires_device_idle {
            mask |= Constraint::Idle.bit();
        }
        mask |= match self.network {
            None => 0,
            Some(NetworkType::Any) => Constraint::Connectivity.bit(),
            Some(NetworkType::Unmetered) => Constraint::Unmetered.bit(),
            Some(NetworkType::NotRoaming) => Constraint::NotRoaming.bit(),
            Some(NetworkType::Metered) => Constraint::Metered.bit(),
        };
        mask
    }
}

/// One bit of the satisfied-constraints mask maintained by controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Constraint {
    Charging = 1 << 0,
    BatteryNotLow = 1 << 1,
    StorageNotLow = 1 << 2,
    Idle = 1 << 3,
    Connectivity = 1 << 4,
    Unmetered = 1 << 5,
    NotRoaming = 1 << 6,
    Metered = 1 << 7,
    /// The earliest-run (delay) bound has passed.
    Timing = 1 << 8,
    /// The latest-run (deadline) bound has passed.
    Deadline = 1 << 9,
    /// The owning app is not in standby; gates every other constraint.
    AppNotIdle = 1 << 10,
}

impl Constraint {
    pub const fn bit(self) -> u32 {
        self as u32
    }
}

/// Requested timing, as submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Run once per `period`, anywhere inside the trailing `flex` window.
    Periodic { period: Duration, flex: Duration },
    /// Run once, no earlier than `min_latency` and no later than
    /// `override_deadline` after scheduling (both optional).
    OneOff {
        min_latency: Option<Duration>,
        override_deadline: Option<Duration>,
    },
}

impl Schedule {
    pub fn one_off() -> Self {
        Schedule::OneOff {
            min_latency: None,
            override_deadline: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Linear,
    Exponential,
}

/// How long to wait before retrying a job that asked to be rescheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub kind: BackoffKind,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: DEFAULT_INITIAL_BACKOFF,
            kind: BackoffKind::Exponential,
        }
    }
}

impl BackoffPolicy {
    /// Delay before attempt number `attempt` (1-based), capped at `max`.
    pub fn delay_for(&self, attempt: u32, max: Duration) -> Duration {
        let initial = self.initial.as_millis() as u64;
        let attempt = attempt.max(1) as u64;
        let millis = match self.kind {
            BackoffKind::Linear => initial.saturating_mul(attempt),
            BackoffKind::Exponential => {
                let factor = 1u64.checked_shl((attempt - 1) as u32).unwrap_or(u64::MAX);
                initial.saturating_mul(factor)
            }
        };
        Duration::from_millis(millis).min(max)
    }
}

/// One unit of an optional FIFO attached to a job, pulled by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u32,
    pub payload: serde_json::Value,
    /// How many times this item has been handed to a client.
    #[serde(default)]
    pub delivery_count: u32,
}

impl WorkItem {
    pub fn new(id: u32, payload: serde_json::Value) -> Self {
        Self {
            id,
            payload,
            delivery_count: 0,
        }
    }
}

/// The app a job does its work on behalf of (may differ from the owner
/// when a system component schedules for another package).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSource {
    pub package: String,
    pub group: GroupId,
    pub tag: Option<String>,
}

/// Wall-clock bounds read from the snapshot while the clock was untrusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WallClockBounds {
    pub earliest: Option<i64>,
    pub latest: Option<i64>,
}

impl WallClockBounds {
    /// Re-base onto the elapsed clock. Bounds already in the past collapse
    /// to `now_elapsed`; bounds too far out to represent are rejected.
    pub fn to_elapsed(self, now_elapsed: i64, now_wall: i64) -> Result<(Option<i64>, Option<i64>)> {
        let convert = |bound: Option<i64>| -> Result<Option<i64>> {
            bound
                .map(|wall| {
                    wall.checked_sub(now_wall)
                        .and_then(|delta| delta.max(0).checked_add(now_elapsed))
                        .ok_or_else(|| {
                            StoreError::InvalidJob(format!("wall-clock bound {wall} out of range"))
                        })
                })
                .transpose()
        };
        Ok((convert(self.earliest)?, convert(self.latest)?))
    }
}

/// A job as submitted by a client, before the store assigns timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInfo {
    pub job_id: JobId,
    pub service: ComponentName,
    #[serde(default)]
    pub constraints: Constraints,
    pub schedule: Schedule,
    #[serde(default)]
    pub backoff: BackoffPolicy,
    #[serde(default)]
    pub persisted: bool,
    #[serde(default)]
    pub extras: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub flags: u32,
    #[serde(default)]
    pub work: Vec<WorkItem>,
}

impl JobInfo {
    pub fn new(job_id: impl Into<JobId>, service: ComponentName, schedule: Schedule) -> Self {
        Self {
            job_id: job_id.into(),
            service,
            constraints: Constraints::default(),
            schedule,
            backoff: BackoffPolicy::default(),
            persisted: false,
            extras: serde_json::Map::new(),
            priority: 0,
            flags: 0,
            work: Vec::new(),
        }
    }

    /// Check consistency and clamp timing and backoff into `limits`.
    pub fn normalized(mut self, limits: &LimitsConfig) -> Result<Self> {
        match &mut self.schedule {
            Schedule::Periodic { period, flex } => {
                let min_period = Duration::from_millis(limits.min_period_ms);
                let min_flex = Duration::from_millis(limits.min_flex_ms);
                *period = (*period).max(min_period);
                *flex = (*flex).max(min_flex).min(*period);
            }
            Schedule::OneOff {
                min_latency,
                override_deadline,
            } => {
                if let (Some(delay), Some(deadline)) = (*min_latency, *override_deadline) {
                    if delay > deadline {
                        return Err(StoreError::InvalidJob(format!(
                            "job {}: min latency exceeds deadline",
                            self.job_id
                        )));
                    }
                }
                if min_latency.is_none()
                    && override_deadline.is_none()
                    && self.constraints == Constraints::default()
                    && self.work.is_empty()
                {
                    return Err(StoreError::InvalidJob(format!(
                        "job {}: at least one constraint or timing bound is required",
                        self.job_id
                    )));
                }
            }
        }
        if self.persisted && !self.work.is_empty() {
            return Err(StoreError::InvalidJob(format!(
                "job {}: persisted jobs cannot carry work items",
                self.job_id
            )));
        }
        self.backoff.initial = self.backoff.initial.max(MIN_INITIAL_BACKOFF);
        Ok(self)
    }
}

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_instance() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// One scheduled unit of work as tracked by the store.
#[derive(Debug, Clone)]
pub struct JobRecord {
    /// Distinguishes a replacement from the record it replaced; survives
    /// constraint updates, changes on every reschedule.
    pub(crate) instance: u64,
    pub(crate) key: JobKey,
    pub(crate) service: ComponentName,
    pub(crate) source: JobSource,
    pub(crate) constraints: Constraints,
    pub(crate) schedule: Schedule,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) earliest_run_elapsed: Option<i64>,
    pub(crate) latest_run_elapsed: Option<i64>,
    pub(crate) wall_clock_bounds: Option<WallClockBounds>,
    pub(crate) num_failures: u32,
    pub(crate) last_successful_run: Option<i64>,
    pub(crate) last_failed_run: Option<i64>,
    pub(crate) persisted: bool,
    pub(crate) extras: serde_json::Map<String, serde_json::Value>,
    pub(crate) priority: i32,
    pub(crate) flags: u32,
    pub(crate) pending_work: Vec<WorkItem>,
    pub(crate) required: u32,
    pub(crate) satisfied: u32,
}

impl JobRecord {
    /// Build a record for a freshly submitted job.
    ///
    /// `source` defaults to the owner's own package and group.
    pub fn from_info(
        info: JobInfo,
        owner: OwnerId,
        source: Option<JobSource>,
        limits: &LimitsConfig,
        now_elapsed: i64,
    ) -> Result<Self> {
        let info = info.normalized(limits)?;
        let after = |d: Duration| {
            now_elapsed.checked_add(millis(d)).ok_or_else(|| {
                StoreError::InvalidJob(format!("job {}: timing bound out of range", info.job_id))
            })
        };
        let (earliest, latest) = match info.schedule {
            Schedule::Periodic { period, flex } => {
                let latest = after(period)?;
                // flex never exceeds period after normalization
                (Some(latest - millis(flex)), Some(latest))
            }
            Schedule::OneOff {
                min_latency,
                override_deadline,
            } => (
                min_latency.map(after).transpose()?,
                override_deadline.map(after).transpose()?,
            ),
        };
        let source = source.unwrap_or_else(|| JobSource {
            package: info.service.package.clone(),
            group: owner.group(),
            tag: None,
        });
        let record = JobRecord {
            instance: next_instance(),
            key: JobKey::new(owner, info.job_id),
            service: info.service,
            source,
            constraints: info.constraints,
            schedule: info.schedule,
            backoff: info.backoff,
            earliest_run_elapsed: earliest,
            latest_run_elapsed: latest,
            wall_clock_bounds: None,
            num_failures: 0,
            last_successful_run: None,
            last_failed_run: None,
            persisted: info.persisted,
            extras: info.extras,
            priority: info.priority,
            flags: info.flags,
            pending_work: info.work,
            required: 0,
            satisfied: Constraint::AppNotIdle.bit(),
        };
        Ok(record.with_derived_requirements())
    }

    /// Recompute the required-constraints mask from constraints and timing.
    pub(crate) fn with_derived_requirements(mut self) -> Self {
        let mut required = self.constraints.required_mask();
        if self.earliest_run_elapsed.is_some() {
            required |= Constraint::Timing.bit();
        }
        self.required = required;
        self
    }

    pub fn key(&self) -> JobKey {
        self.key
    }

    /// True when `other` is this very record rather than a replacement.
    pub fn same_instance(&self, other: &JobRecord) -> bool {
        self.instance == other.instance
    }

    pub fn owner(&self) -> OwnerId {
        self.key.owner
    }

    pub fn job_id(&self) -> JobId {
        self.key.job_id
    }

    pub fn service(&self) -> &ComponentName {
        &self.service
    }

    pub fn source(&self) -> &JobSource {
        &self.source
    }

    pub fn constraints(&self) -> &Constraints {
        &self.constraints
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.schedule, Schedule::Periodic { .. })
    }

    pub fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    pub fn earliest_run_elapsed(&self) -> Option<i64> {
        self.earliest_run_elapsed
    }

    pub fn latest_run_elapsed(&self) -> Option<i64> {
        self.latest_run_elapsed
    }

    pub fn has_deadline(&self) -> bool {
        self.latest_run_elapsed.is_some()
    }

    /// Wall-clock bounds kept from an untrusted boot, awaiting correction.
    pub fn wall_clock_bounds(&self) -> Option<WallClockBounds> {
        self.wall_clock_bounds
    }

    pub fn num_failures(&self) -> u32 {
        self.num_failures
    }

    pub fn last_successful_run(&self) -> Option<i64> {
        self.last_successful_run
    }

    pub fn last_failed_run(&self) -> Option<i64> {
        self.last_failed_run
    }

    pub fn is_persisted(&self) -> bool {
        self.persisted
    }

    pub fn extras(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.extras
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn flags(&self) -> u32 {
        self.flags
    }

    pub fn pending_work(&self) -> &[WorkItem] {
        &self.pending_work
    }

    pub fn required_constraints(&self) -> u32 {
        self.required
    }

    pub fn satisfied_constraints(&self) -> u32 {
        self.satisfied
    }

    pub fn is_constraint_satisfied(&self, constraint: Constraint) -> bool {
        self.satisfied & constraint.bit() != 0
    }

    /// Flip one satisfied bit. Returns whether the mask changed.
    pub(crate) fn set_constraint_satisfied(&mut self, constraint: Constraint, value: bool) -> bool {
        let before = self.satisfied;
        if value {
            self.satisfied |= constraint.bit();
        } else {
            self.satisfied &= !constraint.bit();
        }
        before != self.satisfied
    }

    /// All required constraints hold, or the deadline has passed.
    pub fn is_ready(&self) -> bool {
        if !self.is_constraint_satisfied(Constraint::AppNotIdle) {
            return false;
        }
        let constraints_met = self.satisfied & self.required == self.required;
        let deadline_met = self.has_deadline() && self.is_constraint_satisfied(Constraint::Deadline);
        constraints_met || deadline_met
    }

    /// Bounds to write to the snapshot, in wall-clock milliseconds.
    ///
    /// Bounds retained from an untrusted boot are written back unchanged.
    pub fn to_wall_clock_bounds(&self, now_elapsed: i64, now_wall: i64) -> WallClockBounds {
        if let Some(bounds) = self.wall_clock_bounds {
            return bounds;
        }
        let convert = |elapsed: i64| now_wall.saturating_add(elapsed.saturating_sub(now_elapsed));
        WallClockBounds {
            earliest: self.earliest_run_elapsed.map(convert),
            latest: self.latest_run_elapsed.map(convert),
        }
    }

    /// Copy with new elapsed bounds; drops any retained wall-clock bounds.
    pub fn with_elapsed_bounds(&self, earliest: Option<i64>, latest: Option<i64>) -> Self {
        let mut next = self.with_corrected_bounds(earliest, latest);
        next.instance = next_instance();
        next
    }

    /// Same job re-based onto the elapsed clock after a wall-clock fix.
    ///
    /// Keeps `instance`, so a run already holding this record still matches
    /// it when it completes.
    pub(crate) fn with_corrected_bounds(&self, earliest: Option<i64>, latest: Option<i64>) -> Self {
        let mut next = self.clone();
        next.earliest_run_elapsed = earliest;
        next.latest_run_elapsed = latest;
        next.wall_clock_bounds = None;
        next.with_derived_requirements()
    }

    /// Copy carrying `work` as the pending queue for the next run.
    pub fn with_pending_work(&self, work: Vec<WorkItem>) -> Self {
        let mut next = self.clone();
        next.instance = next_instance();
        next.pending_work = work;
        next
    }

    /// Next attempt after a run that asked to be retried.
    pub fn reschedule_for_failure(&self, clock: &dyn Clock, limits: &LimitsConfig) -> Self {
        let attempt = self.num_failures + 1;
        let delay = self
            .backoff
            .delay_for(attempt, Duration::from_millis(limits.max_backoff_ms));
        let earliest = clock.elapsed_millis().saturating_add(millis(delay));
        let mut next = self.with_elapsed_bounds(Some(earliest), None);
        next.num_failures = attempt;
        next.last_failed_run = Some(clock.wall_millis());
        next
    }

    /// Next window for a periodic job that completed normally.
    ///
    /// Running early inside the flex window carries the unused part of the
    /// current window forward, so the period stays anchored.
    pub fn reschedule_for_periodic(&self, clock: &dyn Clock) -> Option<Self> {
        let Schedule::Periodic { period, flex } = self.schedule else {
            return None;
        };
        let now = clock.elapsed_millis();
        let run_early = self
            .latest_run_elapsed
            .map(|latest| latest.saturating_sub(now).max(0))
            .unwrap_or(0);
        let latest = now.saturating_add(run_early).saturating_add(millis(period));
        let earliest = latest.saturating_sub(millis(flex));
        let mut next = self.with_elapsed_bounds(Some(earliest), Some(latest));
        next.num_failures = 0;
        next.last_successful_run = Some(clock.wall_millis());
        Some(next)
    }
}

pub(crate) fn millis(d: Duration) -> i64 {
    d.as_millis().min(i64::MAX as u128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhost_core::ManualClock;

    fn service() -> ComponentName {
        ComponentName::new("com.example", "com.example.SyncService")
    }

    fn limits() -> LimitsConfig {
        LimitsConfig::default()
    }

    #[test]
    fn one_off_bounds_follow_latency_and_deadline() {
        let info = JobInfo::new(
            1,
            service(),
            Schedule::OneOff {
                min_latency: Some(Duration::from_secs(10)),
                override_deadline: Some(Duration::from_secs(60)),
            },
        );
        let job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 1_000).unwrap();
        assert_eq!(job.earliest_run_elapsed(), Some(11_000));
        assert_eq!(job.latest_run_elapsed(), Some(61_000));
        assert_eq!(job.source().package, "com.example");
        assert!(job.required_constraints() & Constraint::Timing.bit() != 0);
    }

    #[test]
    fn periodic_flex_is_clamped_into_period() {
        let hour = Duration::from_secs(3600);
        let info = JobInfo::new(
            2,
            service(),
            Schedule::Periodic {
                period: Duration::from_secs(60),
                flex: hour,
            },
        );
        let job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 0).unwrap();
        let min_period = limits().min_period_ms as i64;
        assert_eq!(job.latest_run_elapsed(), Some(min_period));
        // flex clamped down to the (raised) period → window opens immediately
        assert_eq!(job.earliest_run_elapsed(), Some(0));
    }

    #[test]
    fn unconstrained_one_off_rejected() {
        let info = JobInfo::new(3, service(), Schedule::one_off());
        assert!(matches!(
            info.normalized(&limits()),
            Err(StoreError::InvalidJob(_))
        ));
    }

    #[test]
    fn persisted_job_with_work_rejected() {
        let mut info = JobInfo::new(4, service(), Schedule::one_off());
        info.persisted = true;
        info.work.push(WorkItem::new(1, serde_json::json!({"n": 1})));
        assert!(info.normalized(&limits()).is_err());
    }

    #[test]
    fn readiness_requires_all_bits_or_deadline() {
        let mut info = JobInfo::new(
            5,
            service(),
            Schedule::OneOff {
                min_latency: None,
                override_deadline: Some(Duration::from_secs(30)),
            },
        );
        info.constraints.requires_charging = true;
        info.constraints.network = Some(NetworkType::Unmetered);
        let mut job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 0).unwrap();
        assert!(!job.is_ready());

        assert!(job.set_constraint_satisfied(Constraint::Charging, true));
        assert!(!job.set_constraint_satisfied(Constraint::Charging, true));
        assert!(!job.is_ready());
        job.set_constraint_satisfied(Constraint::Unmetered, true);
        assert!(job.is_ready());

        job.set_constraint_satisfied(Constraint::Unmetered, false);
        job.set_constraint_satisfied(Constraint::Deadline, true);
        assert!(job.is_ready());

        job.set_constraint_satisfied(Constraint::AppNotIdle, false);
        assert!(!job.is_ready());
    }

    #[test]
    fn backoff_linear_and_exponential() {
        let max = Duration::from_secs(5 * 3600);
        let linear = BackoffPolicy {
            initial: Duration::from_secs(30),
            kind: BackoffKind::Linear,
        };
        assert_eq!(linear.delay_for(3, max), Duration::from_secs(90));
        let exp = BackoffPolicy::default();
        assert_eq!(exp.delay_for(1, max), Duration::from_secs(30));
        assert_eq!(exp.delay_for(4, max), Duration::from_secs(240));
        assert_eq!(exp.delay_for(40, max), max);
    }

    #[test]
    fn failure_reschedule_drops_deadline_and_counts() {
        let clock = ManualClock::new(100_000, 1_700_000_000_000);
        let mut info = JobInfo::new(
            6,
            service(),
            Schedule::OneOff {
                min_latency: None,
                override_deadline: Some(Duration::from_secs(5)),
            },
        );
        info.constraints.requires_device_idle = true;
        let job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 0).unwrap();
        let retry = job.reschedule_for_failure(&clock, &limits());
        assert_eq!(retry.num_failures(), 1);
        assert_eq!(retry.earliest_run_elapsed(), Some(130_000));
        assert_eq!(retry.latest_run_elapsed(), None);
        assert_eq!(retry.last_failed_run(), Some(1_700_000_000_000));
        let again = retry.reschedule_for_failure(&clock, &limits());
        assert_eq!(again.earliest_run_elapsed(), Some(160_000));
    }

    #[test]
    fn periodic_reschedule_carries_early_run_forward() {
        let period = Duration::from_secs(3600);
        let flex = Duration::from_secs(600);
        let info = JobInfo::new(7, service(), Schedule::Periodic { period, flex });
        let job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 0).unwrap();
        // ran 200s before the window end
        let clock = ManualClock::new(3_400_000, 0);
        let next = job.reschedule_for_periodic(&clock).unwrap();
        assert_eq!(next.latest_run_elapsed(), Some(3_400_000 + 200_000 + 3_600_000));
        assert_eq!(next.earliest_run_elapsed(), Some(7_200_000 - 600_000));
        assert_eq!(next.last_successful_run(), Some(0));
    }

    #[test]
    fn wall_clock_round_trip() {
        let info = JobInfo::new(
            8,
            service(),
            Schedule::OneOff {
                min_latency: Some(Duration::from_secs(10)),
                override_deadline: None,
            },
        );
        let job = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 5_000).unwrap();
        let wall = job.to_wall_clock_bounds(5_000, 1_000_000);
        assert_eq!(wall.earliest, Some(1_010_000));
        assert_eq!(wall.latest, None);
        assert_eq!(wall.to_elapsed(0, 1_000_000).unwrap(), (Some(10_000), None));
        // already-past bounds collapse to now
        assert_eq!(wall.to_elapsed(42, 2_000_000).unwrap(), (Some(42), None));
    }

    #[test]
    fn latency_after_deadline_is_rejected() {
        let info = JobInfo::new(
            10,
            service(),
            Schedule::OneOff {
                min_latency: Some(Duration::from_secs(120)),
                override_deadline: Some(Duration::from_secs(60)),
            },
        );
        let err = info.normalized(&limits()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidJob(_)));
    }

    #[test]
    fn unrepresentable_delay_is_rejected() {
        let info = JobInfo::new(
            9,
            service(),
            Schedule::OneOff {
                min_latency: Some(Duration::MAX),
                override_deadline: None,
            },
        );
        let err = JobRecord::from_info(info, OwnerId(10_001), None, &limits(), 5_000).unwrap_err();
        assert!(matches!(err, StoreError::InvalidJob(_)));
    }

    #[test]
    fn wall_bounds_outside_i64_range_are_rejected() {
        let wall = WallClockBounds {
            earliest: None,
            latest: Some(i64::MIN),
        };
        assert!(wall.to_elapsed(0, 1_000_000).is_err());
        let wall = WallClockBounds {
            earliest: Some(i64::MAX),
            latest: None,
        };
        assert!(wall.to_elapsed(10, -10).is_err());
    }
}
