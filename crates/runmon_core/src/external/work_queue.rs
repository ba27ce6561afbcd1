//! Work queue for ingestion tasks.
//!
//! The queue deduplicates by `(run id, output kind)`: a key that is
//! pending or in flight cannot be enqueued again until a worker calls
//! [`InProcessQueue::complete`] for it.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OutputKind, RunId};

/// One ingestion unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestTask {
    pub run_id: RunId,
    pub output: OutputKind,
}

impl IngestTask {
    pub fn new(run_id: RunId, output: OutputKind) -> Self {
        Self { run_id, output }
    }

    /// Deduplication key.
    pub fn key(&self) -> (RunId, OutputKind) {
        (self.run_id, self.output)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Work queue is closed")]
    Closed,
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Accepts ingestion tasks for asynchronous execution.
pub trait WorkQueue: Send + Sync {
    /// Enqueue `task`; returns `false` if its key is already pending or in flight.
    fn enqueue(&self, task: IngestTask) -> QueueResult<bool>;
}

#[derive(Debug, Default)]
struct QueueState {
    pending: VecDeque<IngestTask>,
    /// Keys that are pending or being executed.
    in_flight: HashSet<(RunId, OutputKind)>,
    closed: bool,
}

/// In-process queue shared between the driver and worker threads.
#[derive(Debug, Default)]
pub struct InProcessQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for the next task.
    ///
    /// Returns `Ok(None)` on timeout and `Err(Closed)` once the queue is
    /// closed and drained.
    pub fn take(&self, timeout: Duration) -> QueueResult<Option<IngestTask>> {
        let mut state = self.state.lock();
        if state.pending.is_empty() && !state.closed {
            self.available.wait_for(&mut state, timeout);
        }
        match state.pending.pop_front() {
            Some(task) => Ok(Some(task)),
            None if state.closed => Err(QueueError::Closed),
            None => Ok(None),
        }
    }

    /// Release the task's key so it can be enqueued again.
    pub fn complete(&self, task: &IngestTask) {
        self.state.lock().in_flight.remove(&task.key());
    }

    /// Stop accepting tasks and wake every waiting worker.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Remove and return every pending task (single-threaded draining).
    pub fn drain(&self) -> Vec<IngestTask> {
        self.state.lock().pending.drain(..).collect()
    }
}

impl WorkQueue for InProcessQueue {
    fn enqueue(&self, task: IngestTask) -> QueueResult<bool> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(QueueError::Closed);
        }
        if !state.in_flight.insert(task.key()) {
            tracing::debug!(run_id = task.run_id, output = %task.output, "Ingestion already queued");
            return Ok(false);
        }
        state.pending.push_back(task);
        drop(state);
        self.available.notify_one();
        Ok(true)
    }
}
