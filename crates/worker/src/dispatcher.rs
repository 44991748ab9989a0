//! Task dispatcher (bounded-concurrency admission).
//!
//! A single loop pulls job ids in FIFO order, waits for a capacity slot,
//! claims the job (`pending -> running`) and hands it to a [`ProcessRunner`]
//! on its own task. The slot moves into that task and is released when it
//! ends, whatever the outcome. An id counts as queued until its claim has
//! been attempted, so it cannot be admitted twice.

use std::collections::HashSet;
use std::sync::Arc;

use esprelay_core::error::CoreError;
use esprelay_core::types::JobId;
use esprelay_db::JobStore;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::capacity::Capacity;
use crate::runner::{self, ProcessRunner};

// ---------------------------------------------------------------------------
// DispatchQueue
// ---------------------------------------------------------------------------

/// Cloneable submission side of the dispatcher.
#[derive(Clone)]
pub struct DispatchQueue {
    tx: mpsc::UnboundedSender<JobId>,
    queued: Arc<Mutex<HashSet<JobId>>>,
}

impl DispatchQueue {
    /// Queue `job_id` for execution. Returns `false` if it is already
    /// waiting in the queue (including waiting for a slot) or the
    /// dispatcher has stopped.
    pub fn enqueue(&self, job_id: JobId) -> bool {
        let mut queued = self.queued.lock();
        if !queued.insert(job_id.clone()) {
            tracing::debug!(job_id = %job_id, "Job already queued");
            return false;
        }
        if self.tx.send(job_id.clone()).is_err() {
            queued.remove(&job_id);
            tracing::warn!(job_id = %job_id, "Dispatcher stopped, job not queued");
            return false;
        }
        tracing::debug!(job_id = %job_id, depth = queued.len(), "Job queued");
        true
    }

    /// Jobs waiting for admission.
    pub fn depth(&self) -> usize {
        self.queued.lock().len()
    }
}

// ---------------------------------------------------------------------------
// TaskDispatcher
// ---------------------------------------------------------------------------

pub struct TaskDispatcher {
    store: Arc<dyn JobStore>,
    runner: Arc<ProcessRunner>,
    capacity: Capacity,
    queue: DispatchQueue,
    rx: mpsc::UnboundedReceiver<JobId>,
    tracker: TaskTracker,
}

impl TaskDispatcher {
    pub fn new(store: Arc<dyn JobStore>, runner: Arc<ProcessRunner>, capacity: Capacity) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            store,
            runner,
            capacity,
            queue: DispatchQueue {
                tx,
                queued: Arc::new(Mutex::new(HashSet::new())),
            },
            rx,
            tracker: TaskTracker::new(),
        }
    }

    pub fn queue(&self) -> DispatchQueue {
        self.queue.clone()
    }

    pub fn capacity(&self) -> Capacity {
        self.capacity.clone()
    }

    /// Run the dispatch loop until `cancel` fires, then wait for jobs that
    /// are already running to finish.
    pub async fn run(mut self, cancel: CancellationToken) {
        tracing::info!(max_concurrent_jobs = self.capacity.total(), "Task dispatcher started");

        loop {
            let job_id = tokio::select! {
                _ = cancel.cancelled() => break,
                next = self.rx.recv() => match next {
                    Some(job_id) => job_id,
                    None => break,
                },
            };
            let slot = tokio::select! {
                _ = cancel.cancelled() => break,
                slot = self.capacity.acquire() => match slot {
                    Some(slot) => slot,
                    None => break,
                },
            };

            let claimed = runner::claim(self.store.as_ref(), &job_id).await;
            self.queue.queued.lock().remove(&job_id);

            match claimed {
                Ok(job) => {
                    tracing::info!(
                        job_id = %job_id,
                        kind = %job.kind,
                        available = self.capacity.available(),
                        "Job admitted",
                    );
                    let runner = Arc::clone(&self.runner);
                    self.tracker.spawn(async move {
                        let _slot = slot;
                        runner.execute(job).await;
                    });
                }
                Err(CoreError::InvalidTransition { from, .. }) => {
                    tracing::debug!(job_id = %job_id, status = %from, "Job is not pending, skipped");
                }
                Err(CoreError::NotFound { .. }) => {
                    tracing::warn!(job_id = %job_id, "Queued job missing from store, discarded");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to claim queued job, discarded");
                }
            }
        }

        tracing::info!(running = self.tracker.len(), "Task dispatcher shutting down");
        self.tracker.close();
        self.tracker.wait().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
