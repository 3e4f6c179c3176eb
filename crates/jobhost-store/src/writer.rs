//! Dedicated snapshot I/O worker.
//!
//! Rewrites run on their own OS thread so disk latency never reaches the
//! callers of the store. Queued rewrite requests coalesce: the snapshot is a
//! full rewrite, so one write covers every request queued before it.

use jobhost_core::clock::Clock;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::error::Result;
use crate::snapshot;
use crate::store::JobSet;

pub(crate) enum WriteRequest {
    Persist,
    Flush(oneshot::Sender<()>),
}

/// Sending half of the I/O worker. Dropping it stops the thread once the
/// queue is drained.
pub(crate) struct SnapshotWriter {
    tx: mpsc::UnboundedSender<WriteRequest>,
}

impl SnapshotWriter {
    pub(crate) fn spawn(
        path: PathBuf,
        jobs: Arc<Mutex<JobSet>>,
        clock: Arc<dyn Clock>,
        write_failed: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = Worker {
            path,
            jobs,
            clock,
            write_failed,
        };
        std::thread::Builder::new()
            .name("jobstore-io".to_string())
            .spawn(move || worker.run(rx))?;
        Ok(Self { tx })
    }

    pub(crate) fn request_write(&self) {
        if self.tx.send(WriteRequest::Persist).is_err() {
            error!("snapshot writer is gone; change stays in memory only");
        }
    }

    /// Resolves once every request queued before this one has been handled.
    pub(crate) async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriteRequest::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

struct Worker {
    path: PathBuf,
    jobs: Arc<Mutex<JobSet>>,
    clock: Arc<dyn Clock>,
    write_failed: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, mut rx: mpsc::UnboundedReceiver<WriteRequest>) {
        debug!(path = %self.path.display(), "snapshot writer started");
        while let Some(first) = rx.blocking_recv() {
            let mut persist = false;
            let mut waiters = Vec::new();
            let mut next = Some(first);
            while let Some(req) = next {
                match req {
                    WriteRequest::Persist => persist = true,
                    WriteRequest::Flush(done) => waiters.push(done),
                }
                next = rx.try_recv().ok();
            }
            if persist {
                self.write_snapshot();
            }
            for done in waiters {
                let _ = done.send(());
            }
        }
        debug!("snapshot writer stopped");
    }

    fn write_snapshot(&self) {
        // Copy references under the lock; encode and write without it.
        let persisted = {
            let jobs = self.jobs.lock().expect("job store lock poisoned");
            jobs.persisted_snapshot()
        };
        let now_elapsed = self.clock.elapsed_millis();
        let now_wall = self.clock.wall_millis();

        let result = snapshot::encode(&persisted, now_elapsed, now_wall)
            .and_then(|bytes| snapshot::write_atomic(&self.path, &bytes));
        match result {
            Ok(()) => {
                debug!(jobs = persisted.len(), path = %self.path.display(), "snapshot written");
            }
            Err(e) => {
                // next mutation retries regardless of the batching threshold
                self.write_failed.store(true, Ordering::SeqCst);
                error!(path = %self.path.display(), error = %e, "snapshot write failed");
            }
        }
    }
}
