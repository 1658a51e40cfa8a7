//! Worker bookkeeping for pooled relays: each destination keeps a set of
//! long-lived client tasks feeding off a shared blocking deque, spawning
//! a new worker only when none is idle and the pool bound allows it.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use mailway_common::Envelope;
use parking_lot::Mutex;
use tokio::{sync::oneshot, task::JoinHandle};

use crate::relay::RelayResult;

/// One delivery handed to a pool: the envelope and the channel the
/// worker reports the outcome on.
pub(crate) struct DeliveryRequest {
    pub result: oneshot::Sender<RelayResult>,
    pub envelope: Envelope,
}

/// Shared flag a worker raises while it is blocked polling for work.
pub(crate) struct WorkerState {
    idle: AtomicBool,
}

impl WorkerState {
    fn new() -> Self {
        Self {
            idle: AtomicBool::new(false),
        }
    }

    pub fn set_idle(&self, idle: bool) {
        self.idle.store(idle, Ordering::Relaxed);
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Relaxed)
    }
}

pub(crate) struct WorkerPool {
    workers: Mutex<Vec<(Arc<WorkerState>, JoinHandle<()>)>>,
    pool_size: Option<usize>,
}

impl WorkerPool {
    pub fn new(pool_size: Option<usize>) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            pool_size,
        }
    }

    /// Called on each new delivery request: when no live worker is idle
    /// and the pool bound allows, spawn another one.
    pub fn check_idle(&self, spawn: impl FnOnce(Arc<WorkerState>) -> JoinHandle<()>) {
        let mut workers = self.workers.lock();
        workers.retain(|(_, handle)| !handle.is_finished());

        if workers.iter().any(|(state, _)| state.is_idle()) {
            return;
        }
        if let Some(limit) = self.pool_size {
            if workers.len() >= limit {
                return;
            }
        }

        let state = Arc::new(WorkerState::new());
        let handle = spawn(Arc::clone(&state));
        workers.push((state, handle));
    }

    pub fn worker_count(&self) -> usize {
        let mut workers = self.workers.lock();
        workers.retain(|(_, handle)| !handle.is_finished());
        workers.len()
    }

    /// Abort every worker task.
    pub fn kill(&self) {
        for (_, handle) in self.workers.lock().drain(..) {
            handle.abort();
        }
    }
}
