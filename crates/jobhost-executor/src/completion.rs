//! Feeds finished runs back into the job store.

use jobhost_core::config::LimitsConfig;
use jobhost_store::JobStore;
use std::sync::Arc;
use tracing::{debug, info};

use crate::client::CompletionListener;
use crate::types::JobOutcome;

/// Replaces a finished job with its next incarnation, or drops it.
///
/// | outcome                         | store effect                           |
/// |---------------------------------|----------------------------------------|
/// | reschedule requested            | backoff copy carrying unfinished work  |
/// | periodic, no reschedule         | next period's window                   |
/// | one-off, no reschedule          | removed and written back               |
/// | job replaced or cancelled meanwhile | nothing                            |
pub struct StoreCompletionHandler {
    store: Arc<JobStore>,
    limits: LimitsConfig,
}

impl StoreCompletionHandler {
    pub fn new(store: Arc<JobStore>, limits: LimitsConfig) -> Self {
        Self { store, limits }
    }
}

impl CompletionListener for StoreCompletionHandler {
    fn on_job_completed(&self, outcome: JobOutcome) {
        let job = &outcome.job;
        let clock = self.store.clock().clone();
        let next = if outcome.needs_reschedule {
            Some(
                job.reschedule_for_failure(clock.as_ref(), &self.limits)
                    .with_pending_work(outcome.unfinished_work),
            )
        } else {
            job.reschedule_for_periodic(clock.as_ref())
        };

        // the successor's add writes back, so only a plain removal needs to
        if !self.store.remove(job, next.is_none()) {
            debug!(job = %job.key(), "job changed while running; outcome dropped");
            return;
        }
        match next {
            Some(next) => {
                info!(
                    job = %next.key(),
                    failures = next.num_failures(),
                    earliest = ?next.earliest_run_elapsed(),
                    "job rescheduled"
                );
                self.store.add(next);
            }
            None => debug!(job = %job.key(), "job done"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobhost_core::config::StoreConfig;
    use jobhost_core::{Clock, ComponentName, ManualClock, OwnerId};
    use jobhost_store::{JobInfo, JobRecord, Schedule, WorkItem};
    use serde_json::json;
    use std::time::Duration;

    fn store(dir: &tempfile::TempDir, clock: Arc<ManualClock>) -> Arc<JobStore> {
        let config = StoreConfig {
            path: dir.path().join("jobs.json").to_string_lossy().into_owned(),
            write_threshold: 1,
        };
        Arc::new(JobStore::open(&config, clock).unwrap())
    }

    fn record(schedule: Schedule, work: Vec<WorkItem>, now: i64) -> JobRecord {
        let mut info = JobInfo::new(1, ComponentName::new("com.example", "com.example.Sync"), schedule);
        info.constraints.requires_charging = true;
        info.work = work;
        JobRecord::from_info(info, OwnerId(10_001), None, &LimitsConfig::default(), now).unwrap()
    }

    fn outcome(job: Arc<JobRecord>, needs_reschedule: bool, unfinished: Vec<WorkItem>) -> JobOutcome {
        JobOutcome {
            job,
            needs_reschedule,
            stop_reason: None,
            unfinished_work: unfinished,
        }
    }

    #[tokio::test]
    async fn finished_one_off_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0, 1_700_000_000_000));
        let store = store(&dir, clock.clone());
        store.add(record(Schedule::one_off(), vec![], 0));
        let job = store.lookup(OwnerId(10_001), 1.into()).unwrap();

        let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
        handler.on_job_completed(outcome(job, false, vec![]));
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn reschedule_applies_backoff_and_keeps_unfinished_work() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(5_000, 1_700_000_000_000));
        let store = store(&dir, clock.clone());
        let work = vec![WorkItem::new(1, json!("a")), WorkItem::new(2, json!("b"))];
        store.add(record(Schedule::one_off(), work, 5_000));
        let job = store.lookup(OwnerId(10_001), 1.into()).unwrap();

        let mut leftover = WorkItem::new(2, json!("b"));
        leftover.delivery_count = 1;
        let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
        handler.on_job_completed(outcome(job.clone(), true, vec![leftover.clone()]));

        let next = store.lookup(OwnerId(10_001), 1.into()).unwrap();
        assert!(!next.same_instance(&job));
        assert_eq!(next.num_failures(), 1);
        // default policy: 30s exponential
        assert_eq!(next.earliest_run_elapsed(), Some(clock.elapsed_millis() + 30_000));
        assert_eq!(next.pending_work(), &[leftover][..]);
    }

    #[tokio::test]
    async fn periodic_job_moves_to_next_window() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0, 1_700_000_000_000));
        let store = store(&dir, clock.clone());
        let period = Duration::from_secs(3600);
        let flex = Duration::from_secs(600);
        store.add(record(Schedule::Periodic { period, flex }, vec![], 0));
        let job = store.lookup(OwnerId(10_001), 1.into()).unwrap();

        // runs at the very end of its first window
        clock.advance(3_600_000);
        let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
        handler.on_job_completed(outcome(job, false, vec![]));

        let next = store.lookup(OwnerId(10_001), 1.into()).unwrap();
        assert_eq!(next.latest_run_elapsed(), Some(7_200_000));
        assert_eq!(next.earliest_run_elapsed(), Some(6_600_000));
        assert!(next.last_successful_run().is_some());
    }

    #[tokio::test]
    async fn replaced_job_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0, 1_700_000_000_000));
        let store = store(&dir, clock.clone());
        store.add(record(Schedule::one_off(), vec![], 0));
        let ran = store.lookup(OwnerId(10_001), 1.into()).unwrap();
        store.add(record(Schedule::one_off(), vec![], 0));
        let replacement = store.lookup(OwnerId(10_001), 1.into()).unwrap();

        let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
        handler.on_job_completed(outcome(ran, true, vec![]));

        let current = store.lookup(OwnerId(10_001), 1.into()).unwrap();
        assert!(current.same_instance(&replacement));
        assert_eq!(current.num_failures(), 0);
    }

    #[tokio::test]
    async fn clock_correction_during_run_still_completes() {
        let dir = tempfile::tempdir().unwrap();
        let wall = chrono::Utc::now().timestamp_millis();
        {
            let store = store(&dir, Arc::new(ManualClock::new(0, wall)));
            let mut info = JobInfo::new(
                1,
                ComponentName::new("com.example", "com.example.Sync"),
                Schedule::OneOff {
                    min_latency: Some(Duration::from_secs(60)),
                    override_deadline: None,
                },
            );
            info.persisted = true;
            store.add(JobRecord::from_info(info, OwnerId(10_001), None, &LimitsConfig::default(), 0).unwrap());
            store.flush().await;
        }

        // boot with the RTC behind the snapshot
        let clock = Arc::new(ManualClock::new(1_000, 0));
        let store = store(&dir, clock.clone());
        assert!(!store.rtc_good());
        let running = store.lookup(OwnerId(10_001), 1.into()).unwrap();

        clock.set_wall(wall + 10_000);
        assert_eq!(store.on_wall_clock_validated(), 1);

        let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
        handler.on_job_completed(outcome(running, false, vec![]));
        assert_eq!(store.count(), 0);
    }
}
