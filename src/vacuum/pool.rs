use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::master::JobSink;
use super::worker::{execute_job, FinishedJob, VacuumJob, WorkerContext};
use crate::primitives::concurrency::BoundedQueue;
use crate::types::{ReclaimError, Result};

#[derive(Default)]
struct PoolState {
    pending: VecDeque<VacuumJob>,
    busy: usize,
    alive: usize,
    closed: bool,
}

/// Fixed set of worker threads fed by the master.
///
/// Worker `n` always runs in dropped-file slot `n`. Finished jobs go to the
/// shared finished queue; a worker that finds it full snoozes until the
/// master drains it.
pub(crate) struct WorkerPool {
    state: Arc<Mutex<PoolState>>,
    wakeup: Arc<Condvar>,
    idle: Arc<Condvar>,
    workers: usize,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Starts `workers` threads.
    pub(crate) fn spawn(
        workers: usize,
        ctx: Arc<WorkerContext>,
        finished: Arc<BoundedQueue<FinishedJob>>,
    ) -> Result<Self> {
        let state = Arc::new(Mutex::new(PoolState::default()));
        let wakeup = Arc::new(Condvar::new());
        let idle = Arc::new(Condvar::new());
        let mut handles = Vec::with_capacity(workers);
        for slot in 0..workers {
            let state = Arc::clone(&state);
            let wakeup = Arc::clone(&wakeup);
            let idle = Arc::clone(&idle);
            let ctx = Arc::clone(&ctx);
            let finished = Arc::clone(&finished);
            state.lock().alive += 1;
            let handle = thread::Builder::new()
                .name(format!("reclaim-vacuum-worker-{slot}"))
                .spawn(move || worker_loop(slot, ctx, finished, state, wakeup, idle))?;
            handles.push(handle);
        }
        debug!(workers, "vacuum.pool.started");
        Ok(Self {
            state,
            wakeup,
            idle,
            workers,
            handles: Mutex::new(handles),
        })
    }

    /// Jobs queued or running.
    pub(crate) fn load(&self) -> usize {
        let state = self.state.lock();
        state.pending.len() + state.busy
    }

    /// Stops the workers. Queued jobs that never started are returned so the
    /// caller can hand their blocks back. `drain` runs while waiting so
    /// workers blocked on a full finished queue can make progress.
    pub(crate) fn shutdown(&self, mut drain: impl FnMut()) -> Vec<VacuumJob> {
        let unstarted: Vec<VacuumJob> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.pending.drain(..).collect()
        };
        self.wakeup.notify_all();
        loop {
            drain();
            let mut state = self.state.lock();
            if state.alive == 0 {
                break;
            }
            self.idle.wait_for(&mut state, Duration::from_millis(1));
        }
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                warn!("vacuum.pool.worker_panicked");
            }
        }
        debug!(unstarted = unstarted.len(), "vacuum.pool.stopped");
        unstarted
    }
}

impl JobSink for WorkerPool {
    fn is_saturated(&self) -> bool {
        self.load() >= self.workers
    }

    fn submit(&self, job: VacuumJob) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(ReclaimError::Shutdown);
            }
            state.pending.push_back(job);
        }
        self.wakeup.notify_one();
        Ok(())
    }
}

fn worker_loop(
    slot: usize,
    ctx: Arc<WorkerContext>,
    finished: Arc<BoundedQueue<FinishedJob>>,
    state: Arc<Mutex<PoolState>>,
    wakeup: Arc<Condvar>,
    idle: Arc<Condvar>,
) {
    loop {
        let job = {
            let mut guard = state.lock();
            loop {
                if let Some(job) = guard.pending.pop_front() {
                    guard.busy += 1;
                    break Some(job);
                }
                if guard.closed {
                    break None;
                }
                wakeup.wait(&mut guard);
            }
        };
        let Some(job) = job else {
            break;
        };
        let mut done = execute_job(&ctx, slot, &job);
        let backoff = Backoff::new();
        while let Err(back) = finished.push(done) {
            done = back;
            backoff.snooze();
        }
        state.lock().busy -= 1;
        idle.notify_all();
    }
    state.lock().alive -= 1;
    idle.notify_all();
    debug!(slot, "vacuum.pool.worker_exit");
}
