// Context pool assignment and the store round trip.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{job, BindMode, Harness, OWNER};
use jobhost_core::config::{LimitsConfig, StoreConfig};
use jobhost_core::{JobKey, ManualClock};
use jobhost_executor::{
    ContextDeps, ContextPool, ExecutionError, StopReason, StoreCompletionHandler,
};
use jobhost_store::JobStore;

#[tokio::test(start_paused = true)]
async fn assigns_to_free_contexts_until_exhausted() {
    let h = Harness::new(BindMode::Hold);
    let pool = ContextPool::new(2, h.deps.clone());
    assert_eq!(pool.available(), 2);

    assert_eq!(pool.assign(job(1)).unwrap(), 0);
    assert_eq!(pool.assign(job(2)).unwrap(), 1);
    assert!(matches!(pool.assign(job(3)), Err(ExecutionError::PoolExhausted)));
    assert!(matches!(
        pool.assign(job(1)),
        Err(ExecutionError::AlreadyRunning { .. })
    ));

    assert_eq!(pool.available(), 0);
    assert!(pool.is_running(JobKey::new(OWNER, 2)));
    let mut running: Vec<i32> = pool.running_jobs().iter().map(|j| j.job_id().0).collect();
    running.sort();
    assert_eq!(running, vec![1, 2]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_assign_of_one_key_runs_once() {
    let h = Harness::new(BindMode::Hold);
    let pool = Arc::new(ContextPool::new(4, h.deps.clone()));
    let barrier = Arc::new(std::sync::Barrier::new(8));

    let callers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                pool.assign(job(1))
            })
        })
        .collect();
    let results: Vec<_> = callers.into_iter().map(|t| t.join().unwrap()).collect();

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .all(|e| matches!(e, ExecutionError::AlreadyRunning { .. })));
    assert_eq!(pool.available(), 3);
    assert_eq!(pool.running_jobs().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cancel_by_key_frees_the_context() {
    let mut h = Harness::new(BindMode::Hold);
    let pool = ContextPool::new(2, h.deps.clone());
    pool.assign(job(1)).unwrap();

    assert!(!pool.cancel(JobKey::new(OWNER, 9), StopReason::Cancelled));
    assert!(pool.cancel(JobKey::new(OWNER, 1), StopReason::OwnerRemoved));
    pool.contexts()[0]
        .subscribe()
        .wait_for(|s| s.cancelled)
        .await
        .unwrap();

    h.connector.last_session().connected(h.connector.client());
    let outcome = h.next_outcome().await;
    assert_eq!(outcome.stop_reason, Some(StopReason::OwnerRemoved));
    assert_eq!(pool.available(), 2);
    assert!(!pool.is_running(JobKey::new(OWNER, 1)));
}

#[tokio::test(start_paused = true)]
async fn finished_one_off_leaves_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(0, 1_700_000_000_000));
    let config = StoreConfig {
        path: dir.path().join("jobs.json").to_string_lossy().into_owned(),
        write_threshold: 1,
    };
    let store = Arc::new(JobStore::open(&config, clock.clone()).unwrap());
    store.add(Arc::unwrap_or_clone(job(1)));
    let record = store.lookup(OWNER, 1.into()).unwrap();

    let mut h = Harness::new(BindMode::Connect);
    let handler = StoreCompletionHandler::new(store.clone(), LimitsConfig::default());
    let deps = ContextDeps::new(h.connector.clone(), Arc::new(handler))
        .with_clock(clock.clone())
        .with_timeouts(common::timeouts());
    let pool = ContextPool::new(1, deps);

    pool.assign(record).unwrap();
    let params = h.next_start().await;
    params.callback.acknowledge_start(OWNER, true).unwrap();
    params.callback.job_finished(OWNER, false).unwrap();

    for _ in 0..50 {
        if store.count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(store.count(), 0);
    assert_eq!(pool.available(), 1);
}
