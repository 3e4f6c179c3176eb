use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use jobhost_core::clock::Clock;
use jobhost_core::config::StoreConfig;
use jobhost_core::{GroupId, JobId, JobKey, OwnerId};
use tracing::{debug, info, instrument, warn};

use crate::error::Result;
use crate::record::{Constraint, JobRecord};
use crate::snapshot::{self, LoadReport};
use crate::writer::SnapshotWriter;

/// Observer told about controller-driven readiness changes.
pub trait StoreListener: Send + Sync {
    /// A satisfied-constraint bit of `key` flipped. Called without the store
    /// lock held, so the listener may read the store.
    fn on_constraints_changed(&self, key: JobKey);
}

/// Owner-partitioned index. Guarded by the store mutex.
#[derive(Default)]
pub(crate) struct JobSet {
    by_owner: HashMap<OwnerId, HashMap<JobId, Arc<JobRecord>>>,
    dirty_ops: usize,
}

impl JobSet {
    fn insert(&mut self, job: Arc<JobRecord>) -> Option<Arc<JobRecord>> {
        let key = job.key();
        self.by_owner
            .entry(key.owner)
            .or_default()
            .insert(key.job_id, job)
    }

    fn remove(&mut self, key: JobKey) -> Option<Arc<JobRecord>> {
        let jobs = self.by_owner.get_mut(&key.owner)?;
        let removed = jobs.remove(&key.job_id);
        if jobs.is_empty() {
            self.by_owner.remove(&key.owner);
        }
        removed
    }

    fn get(&self, key: JobKey) -> Option<&Arc<JobRecord>> {
        self.by_owner.get(&key.owner)?.get(&key.job_id)
    }

    fn get_mut(&mut self, key: JobKey) -> Option<&mut Arc<JobRecord>> {
        self.by_owner.get_mut(&key.owner)?.get_mut(&key.job_id)
    }

    fn iter(&self) -> impl Iterator<Item = &Arc<JobRecord>> {
        self.by_owner.values().flat_map(HashMap::values)
    }

    fn len(&self) -> usize {
        self.by_owner.values().map(HashMap::len).sum()
    }

    /// Reference copy of every persisted record, for the I/O worker.
    pub(crate) fn persisted_snapshot(&self) -> Vec<Arc<JobRecord>> {
        self.iter().filter(|j| j.is_persisted()).cloned().collect()
    }
}

/// Authoritative set of known jobs with a durable mirror of the persisted
/// subset.
///
/// Construct one per service and hand out `Arc<JobStore>`; there is no
/// process-wide instance.
pub struct JobStore {
    jobs: Arc<Mutex<JobSet>>,
    writer: SnapshotWriter,
    clock: Arc<dyn Clock>,
    write_threshold: usize,
    write_failed: Arc<AtomicBool>,
    rtc_good: AtomicBool,
    /// Snapshot mtime at boot; the wall clock is trusted again once it
    /// reaches this point.
    file_timestamp: Option<i64>,
    listener: RwLock<Option<Arc<dyn StoreListener>>>,
}

impl JobStore {
    /// Load the snapshot synchronously and start the I/O worker.
    pub fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let path = PathBuf::from(&config.path);
        let report = snapshot::load(&path, clock.as_ref());
        Self::from_report(path, report, config.write_threshold, clock)
    }

    fn from_report(
        path: PathBuf,
        report: LoadReport,
        write_threshold: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let mut set = JobSet::default();
        for job in report.jobs {
            if let Some(dup) = set.insert(Arc::new(job)) {
                warn!(key = %dup.key(), "duplicate job in snapshot; keeping the later one");
            }
        }
        info!(
            jobs = set.len(),
            rtc_good = report.rtc_good,
            path = %path.display(),
            "job store ready"
        );

        let jobs = Arc::new(Mutex::new(set));
        let write_failed = Arc::new(AtomicBool::new(false));
        let writer = SnapshotWriter::spawn(
            path,
            Arc::clone(&jobs),
            Arc::clone(&clock),
            Arc::clone(&write_failed),
        )?;
        Ok(Self {
            jobs,
            writer,
            clock,
            write_threshold: write_threshold.max(1),
            write_failed,
            rtc_good: AtomicBool::new(report.rtc_good),
            file_timestamp: report.file_timestamp,
            listener: RwLock::new(None),
        })
    }

    pub fn set_listener(&self, listener: Arc<dyn StoreListener>) {
        *self.listener.write().expect("store listener lock poisoned") = Some(listener);
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // --- mutation --------------------------------------------------------

    /// Insert `job`, replacing any record with the same identity.
    ///
    /// Returns `true` when a previous record was replaced.
    #[instrument(skip(self, job), fields(key = %job.key()))]
    pub fn add(&self, job: JobRecord) -> bool {
        let persisted = job.is_persisted();
        let mut jobs = self.lock();
        let replaced = jobs.insert(Arc::new(job));
        if let Some(ref old) = replaced {
            debug!(old_persisted = old.is_persisted(), "replaced existing job");
        }
        if persisted || replaced.as_ref().is_some_and(|o| o.is_persisted()) {
            self.maybe_write_locked(&mut jobs);
        }
        replaced.is_some()
    }

    /// Remove `job` if the store still holds that very record (not a later
    /// replacement).
    ///
    /// With `write_back` a persisted record's removal is mirrored to disk.
    pub fn remove(&self, job: &JobRecord, write_back: bool) -> bool {
        let mut jobs = self.lock();
        match jobs.get(job.key()) {
            Some(current) if current.same_instance(job) => {}
            _ => {
                debug!(key = %job.key(), "remove: record no longer current");
                return false;
            }
        }
        jobs.remove(job.key());
        if write_back && job.is_persisted() {
            self.maybe_write_locked(&mut jobs);
        }
        true
    }

    /// Remove whatever record currently holds `key`.
    pub fn remove_key(&self, key: JobKey, write_back: bool) -> Option<Arc<JobRecord>> {
        let mut jobs = self.lock();
        let removed = jobs.remove(key)?;
        if write_back && removed.is_persisted() {
            self.maybe_write_locked(&mut jobs);
        }
        Some(removed)
    }

    /// Drop every job whose owner or source group is not in `allowed`.
    ///
    /// Removals are not written individually; the next snapshot picks them up.
    pub fn remove_owners_not_in(&self, allowed: &[GroupId]) -> usize {
        let mut jobs = self.lock();
        let doomed: Vec<JobKey> = jobs
            .iter()
            .filter(|j| {
                !allowed.contains(&j.owner().group()) || !allowed.contains(&j.source().group)
            })
            .map(|j| j.key())
            .collect();
        for key in &doomed {
            jobs.remove(*key);
        }
        if !doomed.is_empty() {
            info!(removed = doomed.len(), "removed jobs of departed principals");
        }
        doomed.len()
    }

    /// Record a controller's verdict on one constraint of `key`.
    ///
    /// Returns whether the satisfied mask changed. On a change the listener
    /// is notified after the lock is released.
    pub fn set_constraint_satisfied(&self, key: JobKey, constraint: Constraint, value: bool) -> bool {
        let changed = {
            let mut jobs = self.lock();
            match jobs.get_mut(key) {
                // copy-on-write: holders of the old Arc keep a stable view
                Some(job) => Arc::make_mut(job).set_constraint_satisfied(constraint, value),
                None => false,
            }
        };
        if changed {
            let listener = self
                .listener
                .read()
                .expect("store listener lock poisoned")
                .clone();
            if let Some(listener) = listener {
                listener.on_constraints_changed(key);
            }
        }
        changed
    }

    // --- reads -------------------------------------------------------------

    pub fn lookup(&self, owner: OwnerId, job_id: JobId) -> Option<Arc<JobRecord>> {
        self.lock().get(JobKey { owner, job_id }).cloned()
    }

    pub fn contains(&self, key: JobKey) -> bool {
        self.lock().get(key).is_some()
    }

    pub fn list_by_owner(&self, owner: OwnerId) -> Vec<Arc<JobRecord>> {
        self.lock()
            .by_owner
            .get(&owner)
            .map(|jobs| jobs.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Jobs whose owner belongs to `group`.
    pub fn list_by_group(&self, group: GroupId) -> Vec<Arc<JobRecord>> {
        self.lock()
            .by_owner
            .iter()
            .filter(|(owner, _)| owner.group() == group)
            .flat_map(|(_, jobs)| jobs.values().cloned())
            .collect()
    }

    pub fn count(&self) -> usize {
        self.lock().len()
    }

    pub fn count_for_owner(&self, owner: OwnerId) -> usize {
        self.lock().by_owner.get(&owner).map_or(0, HashMap::len)
    }

    /// Visit every record without building an intermediate collection.
    ///
    /// The store lock is held for the whole sweep: the visitor must not call
    /// back into the store.
    pub fn for_each(&self, mut visitor: impl FnMut(&Arc<JobRecord>)) {
        let jobs = self.lock();
        for job in jobs.iter() {
            visitor(job);
        }
    }

    /// Like [`for_each`](Self::for_each), restricted to one owner.
    pub fn for_each_owned_by(&self, owner: OwnerId, mut visitor: impl FnMut(&Arc<JobRecord>)) {
        let jobs = self.lock();
        if let Some(owned) = jobs.by_owner.get(&owner) {
            for job in owned.values() {
                visitor(job);
            }
        }
    }

    // --- wall clock --------------------------------------------------------

    /// Whether the wall clock was trusted at boot (or has been since).
    pub fn rtc_good(&self) -> bool {
        self.rtc_good.load(Ordering::SeqCst)
    }

    /// The wall clock has caught up with the snapshot's mtime.
    pub fn clock_now_valid_to_inflate(&self) -> bool {
        let now = self.clock.wall_millis();
        self.file_timestamp.map_or(true, |ts| now >= ts)
    }

    /// Re-derive elapsed bounds for jobs loaded under an untrusted clock.
    ///
    /// Call after a wall-clock change. Does nothing until the clock has
    /// caught up with the snapshot mtime. Returns the number of corrected jobs.
    pub fn on_wall_clock_validated(&self) -> usize {
        if self.rtc_good() {
            return 0;
        }
        if !self.clock_now_valid_to_inflate() {
            debug!("wall clock still behind snapshot; deferring correction");
            return 0;
        }
        let now_elapsed = self.clock.elapsed_millis();
        let now_wall = self.clock.wall_millis();

        let mut jobs = self.lock();
        let corrected: Vec<JobRecord> = jobs
            .iter()
            .filter_map(|job| {
                let wall = job.wall_clock_bounds()?;
                match wall.to_elapsed(now_elapsed, now_wall) {
                    Ok((earliest, latest)) => Some(job.with_corrected_bounds(earliest, latest)),
                    Err(e) => {
                        warn!(key = %job.key(), error = %e, "cannot re-base job bounds; keeping wall-clock bounds");
                        None
                    }
                }
            })
            .collect();
        let count = corrected.len();
        let any_persisted = corrected.iter().any(JobRecord::is_persisted);
        for job in corrected {
            jobs.remove(job.key());
            jobs.insert(Arc::new(job));
        }
        self.rtc_good.store(true, Ordering::SeqCst);
        if any_persisted {
            self.maybe_write_locked(&mut jobs);
        }
        info!(corrected = count, "wall clock validated; job bounds corrected");
        count
    }

    // --- persistence -------------------------------------------------------

    /// Wait until every snapshot write queued so far has been handled.
    pub async fn flush(&self) {
        self.writer.flush().await;
    }

    fn maybe_write_locked(&self, jobs: &mut JobSet) {
        jobs.dirty_ops += 1;
        let retry = self.write_failed.swap(false, Ordering::SeqCst);
        if jobs.dirty_ops >= self.write_threshold || retry {
            jobs.dirty_ops = 0;
            self.writer.request_write();
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobSet> {
        self.jobs.lock().expect("job store lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{JobInfo, Schedule};
    use jobhost_core::config::LimitsConfig;
    use jobhost_core::{ComponentName, ManualClock};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    const WALL: i64 = 1_700_000_000_000;

    fn open(dir: &tempfile::TempDir, clock: Arc<ManualClock>) -> JobStore {
        let config = StoreConfig {
            path: dir.path().join("jobs.json").to_string_lossy().into_owned(),
            write_threshold: 1,
        };
        JobStore::open(&config, clock).unwrap()
    }

    fn job(owner: u32, job_id: i32, persisted: bool) -> JobRecord {
        let mut info = JobInfo::new(
            job_id,
            ComponentName::new("com.example", "com.example.Sync"),
            Schedule::OneOff {
                min_latency: Some(Duration::from_secs(30)),
                override_deadline: None,
            },
        );
        info.persisted = persisted;
        JobRecord::from_info(info, OwnerId(owner), None, &LimitsConfig::default(), 0).unwrap()
    }

    #[tokio::test]
    async fn add_replaces_same_identity() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(0, WALL)));
        assert!(!store.add(job(10_001, 1, false)));
        assert!(store.add(job(10_001, 1, false)));
        assert!(!store.add(job(10_002, 1, false)));
        assert_eq!(store.count(), 2);
        assert_eq!(store.count_for_owner(OwnerId(10_001)), 1);
    }

    #[tokio::test]
    async fn remove_ignores_replaced_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(0, WALL)));
        let first = job(10_001, 1, false);
        store.add(first.clone());
        store.add(job(10_001, 1, false));
        assert!(!store.remove(&first, true));
        assert!(store.contains(JobKey::new(10_001, 1)));

        let current = store.lookup(OwnerId(10_001), JobId(1)).unwrap();
        assert!(store.remove(&current, true));
        assert_eq!(store.count(), 0);
    }

    #[tokio::test]
    async fn group_listing_and_bulk_removal() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(0, WALL)));
        store.add(job(10_001, 1, false));
        store.add(job(10_002, 2, false));
        store.add(job(1_010_001, 3, false));
        assert_eq!(store.list_by_group(GroupId(0)).len(), 2);
        assert_eq!(store.list_by_group(GroupId(10)).len(), 1);

        assert_eq!(store.remove_owners_not_in(&[GroupId(0)]), 1);
        assert_eq!(store.count(), 2);
        assert!(store.list_by_group(GroupId(10)).is_empty());
    }

    #[tokio::test]
    async fn for_each_visits_everything_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(0, WALL)));
        for id in 0..5 {
            store.add(job(10_001 + (id % 2) as u32, id, false));
        }
        let mut seen = Vec::new();
        store.for_each(|j| seen.push(j.key()));
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 5);

        let mut owned = 0;
        store.for_each_owned_by(OwnerId(10_001), |_| owned += 1);
        assert_eq!(owned, 3);
    }

    struct Counting(AtomicUsize);

    impl StoreListener for Counting {
        fn on_constraints_changed(&self, _key: JobKey) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn constraint_changes_notify_once_per_flip() {
        let dir = tempfile::tempdir().unwrap();
        let store = open(&dir, Arc::new(ManualClock::new(0, WALL)));
        let listener = Arc::new(Counting(AtomicUsize::new(0)));
        store.set_listener(listener.clone());
        store.add(job(10_001, 1, false));
        let key = JobKey::new(10_001, 1);
        let before = store.lookup(key.owner, key.job_id).unwrap();

        assert!(store.set_constraint_satisfied(key, Constraint::Timing, true));
        assert!(!store.set_constraint_satisfied(key, Constraint::Timing, true));
        assert!(!store.set_constraint_satisfied(JobKey::new(1, 1), Constraint::Timing, true));
        assert_eq!(listener.0.load(Ordering::SeqCst), 1);

        let after = store.lookup(key.owner, key.job_id).unwrap();
        assert!(after.is_ready());
        assert!(!before.is_constraint_satisfied(Constraint::Timing));
        assert!(after.same_instance(&before));
    }

    #[tokio::test]
    async fn persisted_mutation_reaches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0, WALL));
        let store = open(&dir, clock.clone());
        store.add(job(10_001, 1, true));
        store.add(job(10_001, 2, false));
        store.flush().await;

        let report = snapshot::load(&dir.path().join("jobs.json"), clock.as_ref());
        assert_eq!(report.jobs.len(), 1);
        assert_eq!(report.jobs[0].key(), JobKey::new(10_001, 1));

        store.remove_key(JobKey::new(10_001, 1), true);
        store.flush().await;
        let report = snapshot::load(&dir.path().join("jobs.json"), clock.as_ref());
        assert!(report.jobs.is_empty());
    }

    #[tokio::test]
    async fn batching_threshold_defers_writes() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(0, WALL));
        let config = StoreConfig {
            path: dir.path().join("jobs.json").to_string_lossy().into_owned(),
            write_threshold: 3,
        };
        let store = JobStore::open(&config, clock.clone()).unwrap();
        store.add(job(10_001, 1, true));
        store.add(job(10_001, 2, true));
        store.flush().await;
        assert!(!dir.path().join("jobs.json").exists());

        store.add(job(10_001, 3, true));
        store.flush().await;
        let report = snapshot::load(&dir.path().join("jobs.json"), clock.as_ref());
        assert_eq!(report.jobs.len(), 3);
    }
}
