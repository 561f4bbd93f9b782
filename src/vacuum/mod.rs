#![forbid(unsafe_code)]

//! Background reclamation of record versions no reader can see any more.
//!
//! The log seals a block every few pages and hands its [`BlockSummary`] to
//! vacuum through a bounded queue. The master thread folds summaries into
//! the durable [`data::VacuumData`] chain, and once every id acting in a
//! block is older than the oldest visible id it hands the block to a
//! worker. Workers replay the block's MVCC operations backwards and remove
//! or clean the records they name. Files dropped in the meantime are
//! tracked in [`dropped::DroppedFileTracker`] so workers never touch a file
//! that no longer exists.
//!
//! [`Vacuum`] wires the pieces together and owns the threads.

pub mod cursor;
pub mod data;
pub mod dropped;
mod master;
pub mod metrics;
mod pool;
pub mod recovery;
pub mod redo;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use self::data::page::VacuumDataEntry;
use self::data::VacuumData;
use self::dropped::page::DroppedFileEntry;
use self::dropped::DroppedFileTracker;
use self::master::{InlineExecutor, VacuumMaster};
use self::metrics::{NoopMetrics, VacuumMetrics};
use self::pool::WorkerPool;
use self::redo::RedoStores;
use self::worker::{FinishedJob, WorkerContext};
use crate::log::{BlockSummary, LogSource};
use crate::mvcc::MvccTable;
use crate::options::VacuumOptions;
use crate::primitives::concurrency::BoundedQueue;
use crate::primitives::pager::PageStore;
use crate::storage::{HeapStore, IndexStore};
use crate::types::{BlockId, FileId, LogPageId, Lsa, Mvccid, ReclaimError, Result};

/// Progress of a shutdown request.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum ShutdownState {
    /// No shutdown was requested.
    Running,
    /// Shutdown was requested; running jobs stop at their next check.
    Requested,
    /// Every job stopped and vacuum data was flushed.
    Registered,
}

const RUNNING: u8 = 0;
const REQUESTED: u8 = 1;
const REGISTERED: u8 = 2;

/// Shared stop signals checked by jobs between log records.
#[derive(Default)]
pub(crate) struct Lifecycle {
    shutdown: AtomicU8,
    interrupt: AtomicBool,
}

impl Lifecycle {
    /// Moves to `Requested`. Returns false when a request was already made.
    pub(crate) fn request_shutdown(&self) -> bool {
        self.shutdown
            .compare_exchange(RUNNING, REQUESTED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn register_shutdown(&self) {
        self.shutdown.store(REGISTERED, Ordering::SeqCst);
    }

    pub(crate) fn shutdown_state(&self) -> ShutdownState {
        match self.shutdown.load(Ordering::SeqCst) {
            RUNNING => ShutdownState::Running,
            REQUESTED => ShutdownState::Requested,
            _ => ShutdownState::Registered,
        }
    }

    pub(crate) fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst) != RUNNING
    }

    pub(crate) fn set_interrupt(&self, on: bool) {
        self.interrupt.store(on, Ordering::SeqCst);
    }

    /// Fails with `Interrupted` once a job has to stop.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_shutdown_requested() || self.interrupt.load(Ordering::Relaxed) {
            Err(ReclaimError::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[derive(Default)]
struct MasterWakeup {
    pending: Mutex<bool>,
    cv: Condvar,
}

impl MasterWakeup {
    fn notify(&self) {
        *self.pending.lock() = true;
        self.cv.notify_all();
    }

    fn wait(&self, timeout: Duration) {
        let mut pending = self.pending.lock();
        if !*pending {
            self.cv.wait_for(&mut pending, timeout);
        }
        *pending = false;
    }
}

/// Collaborators vacuum needs from the rest of the engine.
pub struct VacuumDeps {
    /// Transaction table providing the oldest visible id.
    pub table: Arc<MvccTable>,
    /// Log the blocks are read from and redo is written to.
    pub log: Arc<dyn LogSource>,
    /// Store holding vacuum data.
    pub data_store: Arc<dyn PageStore>,
    /// Store holding dropped files.
    pub dropped_store: Arc<dyn PageStore>,
    /// Heap records.
    pub heap: Arc<dyn HeapStore>,
    /// Index entries.
    pub index: Arc<dyn IndexStore>,
    /// Progress observer.
    pub metrics: Arc<dyn VacuumMetrics>,
}

impl VacuumDeps {
    /// Bundles the collaborators with metrics discarded.
    pub fn new(
        table: Arc<MvccTable>,
        log: Arc<dyn LogSource>,
        data_store: Arc<dyn PageStore>,
        dropped_store: Arc<dyn PageStore>,
        heap: Arc<dyn HeapStore>,
        index: Arc<dyn IndexStore>,
    ) -> Self {
        Self {
            table,
            log,
            data_store,
            dropped_store,
            heap,
            index,
            metrics: Arc::new(NoopMetrics),
        }
    }

    /// Replaces the metrics observer.
    pub fn with_metrics(mut self, metrics: Arc<dyn VacuumMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Snapshot of the subsystem for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct VacuumStats {
    /// Shutdown progress.
    pub shutdown: ShutdownState,
    /// True while the master thread runs.
    pub master_running: bool,
    /// Every id below this one has been vacuumed.
    pub oldest_unvacuumed: Mvccid,
    /// Oldest live block.
    pub first_blockid: Option<BlockId>,
    /// Newest block consumed.
    pub last_blockid: Option<BlockId>,
    /// Live vacuum data entries.
    pub live_entries: usize,
    /// Pages in the vacuum data chain.
    pub data_pages: usize,
    /// Dropped files still tracked.
    pub dropped_files: usize,
    /// Summaries waiting in the production queue.
    pub production_queued: usize,
    /// Reports waiting in the finished queue.
    pub finished_queued: usize,
    /// Oldest log page vacuum still needs.
    pub first_log_page_to_keep: LogPageId,
}

/// Handle on the vacuum subsystem.
///
/// With [`Vacuum::start`] a master thread and a worker pool run in the
/// background until [`Vacuum::stop`]. Without it, [`Vacuum::run_until_idle`]
/// runs master iterations and jobs on the calling thread.
pub struct Vacuum {
    opts: VacuumOptions,
    table: Arc<MvccTable>,
    production: Arc<BoundedQueue<BlockSummary>>,
    finished: Arc<BoundedQueue<FinishedJob>>,
    ctx: Arc<WorkerContext>,
    master: Arc<Mutex<VacuumMaster>>,
    oldest_unvacuumed: Arc<AtomicU64>,
    wakeup: Arc<MasterWakeup>,
    thread: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl Vacuum {
    /// Opens vacuum over stores that were shut down cleanly or are new.
    pub fn open(deps: VacuumDeps, opts: VacuumOptions) -> Result<Self> {
        let opts = opts.normalize();
        if deps.log.pages_per_block() != opts.log_pages_per_block {
            return Err(ReclaimError::Invalid(
                "log block size differs from vacuum options",
            ));
        }
        let production = Arc::new(BoundedQueue::new(
            "vacuum.production",
            opts.production_queue_capacity,
        ));
        let finished = Arc::new(BoundedQueue::new(
            "vacuum.finished",
            opts.finished_queue_capacity,
        ));
        // One extra slot for jobs run inline by `run_until_idle`.
        let dropped = Arc::new(DroppedFileTracker::open(
            Arc::clone(&deps.dropped_store),
            Arc::clone(&deps.log),
            opts.workers + 1,
            opts.drop_wait_spins,
        )?);
        let data = VacuumData::open(
            Arc::clone(&deps.data_store),
            Arc::clone(&deps.log),
            Arc::clone(&deps.metrics),
        )?;
        deps.log.attach_block_queue(Arc::clone(&production))?;

        let oldest_unvacuumed = Arc::new(AtomicU64::new(Mvccid::NULL.0));
        let ctx = Arc::new(WorkerContext {
            log: Arc::clone(&deps.log),
            heap: deps.heap,
            index: deps.index,
            dropped: Arc::clone(&dropped),
            metrics: Arc::clone(&deps.metrics),
            lifecycle: Arc::new(Lifecycle::default()),
        });
        let master = VacuumMaster::new(
            data,
            Arc::clone(&deps.table),
            deps.log,
            Arc::clone(&production),
            Arc::clone(&finished),
            dropped,
            deps.metrics,
            Arc::clone(&oldest_unvacuumed),
            opts.log_tail_margin_pages,
        );
        info!(
            workers = opts.workers,
            enabled = opts.enabled,
            margin = opts.log_tail_margin_pages,
            "vacuum.open"
        );
        Ok(Self {
            opts,
            table: deps.table,
            production,
            finished,
            ctx,
            master: Arc::new(Mutex::new(master)),
            oldest_unvacuumed,
            wakeup: Arc::new(MasterWakeup::default()),
            thread: Mutex::new(None),
        })
    }

    /// Opens vacuum after a crash. Redo logged from `start_lsa` on is
    /// replayed into both stores before they are opened, then in-progress
    /// entries are reset and summaries lost with the production queue are
    /// rebuilt from the log.
    pub fn open_after_crash(deps: VacuumDeps, opts: VacuumOptions, start_lsa: Lsa) -> Result<Self> {
        recovery::notify_server_crashed(
            deps.log.as_ref(),
            RedoStores {
                data: deps.data_store.as_ref(),
                dropped: deps.dropped_store.as_ref(),
                heap: Some(deps.heap.as_ref()),
            },
            start_lsa,
        )?;
        let vacuum = Self::open(deps, opts)?;
        vacuum.master.lock().recover_after_crash()?;
        Ok(vacuum)
    }

    /// Normalized options in effect.
    pub fn options(&self) -> &VacuumOptions {
        &self.opts
    }

    /// Starts the master thread and the worker pool. Does nothing when
    /// vacuum is disabled or already running.
    pub fn start(&self) -> Result<()> {
        if !self.opts.enabled {
            debug!("vacuum.start.disabled");
            return Ok(());
        }
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }
        if self.ctx.lifecycle.is_shutdown_requested() {
            return Err(ReclaimError::Shutdown);
        }
        let pool = WorkerPool::spawn(
            self.opts.workers,
            Arc::clone(&self.ctx),
            Arc::clone(&self.finished),
        )?;
        let master = Arc::clone(&self.master);
        let lifecycle = Arc::clone(&self.ctx.lifecycle);
        let wakeup = Arc::clone(&self.wakeup);
        let interval = self.opts.master_interval_duration();
        let handle = thread::Builder::new()
            .name("reclaim-vacuum-master".to_string())
            .spawn(move || master_loop(master, pool, lifecycle, wakeup, interval))?;
        *thread = Some(handle);
        Ok(())
    }

    /// True while the master thread runs.
    pub fn is_running(&self) -> bool {
        self.thread.lock().is_some()
    }

    /// Asks the master and every running job to stop. Idempotent.
    pub fn notify_shutdown_requested(&self) {
        if self.ctx.lifecycle.request_shutdown() {
            info!("vacuum.shutdown_requested");
        }
        self.wakeup.notify();
    }

    /// Current shutdown progress.
    pub fn shutdown_state(&self) -> ShutdownState {
        self.ctx.lifecycle.shutdown_state()
    }

    /// Requests shutdown and waits until every job stopped and vacuum data
    /// was flushed. Returns the error that stopped the master, if any.
    pub fn stop(&self) -> Result<()> {
        self.notify_shutdown_requested();
        let handle = self.thread.lock().take();
        match handle {
            Some(handle) => handle.join().map_err(|_| ReclaimError::Shutdown)?,
            None => {
                if self.shutdown_state() != ShutdownState::Registered {
                    self.master.lock().refresh()?;
                    self.ctx.lifecycle.register_shutdown();
                }
                Ok(())
            }
        }
    }

    /// Runs master iterations on the calling thread, executing every
    /// dispatched job inline, until nothing more is ready. Returns the number
    /// of jobs run. Fails when the master thread is running.
    pub fn run_until_idle(&self) -> Result<usize> {
        if self.is_running() {
            return Err(ReclaimError::Invalid("vacuum master thread is running"));
        }
        let inline = InlineExecutor {
            ctx: &self.ctx,
            slot: self.opts.workers,
            finished: &self.finished,
        };
        let mut master = self.master.lock();
        let mut total = 0usize;
        loop {
            let report = master.run_iteration(&inline)?;
            total += report.dispatched;
            // An interrupted block is retried once per call, not forever.
            if report.dispatched == 0 || report.interrupted > 0 {
                break;
            }
        }
        master.refresh()?;
        Ok(total)
    }

    /// Interrupts every job at its next check until cleared.
    pub fn set_interrupt(&self, on: bool) {
        self.ctx.lifecycle.set_interrupt(on);
    }

    /// Wakes the master before its interval elapses.
    pub fn wake(&self) {
        self.wakeup.notify();
    }

    /// True when every operation of `mvccid` has been vacuumed.
    pub fn is_mvccid_vacuumed(&self, mvccid: Mvccid) -> bool {
        mvccid < self.get_oldest_unvacuumed_id()
    }

    /// Every id below the returned one has been vacuumed.
    pub fn get_oldest_unvacuumed_id(&self) -> Mvccid {
        Mvccid(self.oldest_unvacuumed.load(Ordering::Acquire))
    }

    /// Records that `file` is being dropped and waits until no worker may
    /// still act on it. The caller may destroy the file afterwards.
    pub fn add_dropped_file(&self, file: FileId) -> Result<()> {
        let at = self.table.peek_next_id();
        self.ctx.dropped.add_drop(file, at)
    }

    /// True when a record of `file` acted on by `mvccid` belongs to a
    /// dropped generation of the file.
    pub fn is_file_dropped(&self, file: FileId, mvccid: Mvccid) -> Result<bool> {
        self.ctx.dropped.is_dropped(file, mvccid)
    }

    /// Oldest log page vacuum still needs.
    pub fn first_log_page_to_keep(&self) -> Result<LogPageId> {
        self.master.lock().data().first_log_page_to_keep()
    }

    /// Live vacuum data entries, oldest first.
    pub fn entries(&self) -> Result<Vec<VacuumDataEntry>> {
        self.master.lock().data().entries()
    }

    /// Dropped files still tracked.
    pub fn dropped_files(&self) -> Result<Vec<DroppedFileEntry>> {
        self.ctx.dropped.entries()
    }

    /// Progress observer.
    pub fn metrics(&self) -> &Arc<dyn VacuumMetrics> {
        &self.ctx.metrics
    }

    /// Diagnostic snapshot.
    pub fn stats(&self) -> Result<VacuumStats> {
        let master = self.master.lock();
        let data = master.data();
        Ok(VacuumStats {
            shutdown: self.shutdown_state(),
            master_running: self.is_running(),
            oldest_unvacuumed: self.get_oldest_unvacuumed_id(),
            first_blockid: data.get_first_blockid()?,
            last_blockid: data.get_last_blockid(),
            live_entries: data.entries()?.len(),
            data_pages: data.page_count()?,
            dropped_files: self.ctx.dropped.entries()?.len(),
            production_queued: self.production.len(),
            finished_queued: self.finished.len(),
            first_log_page_to_keep: data.first_log_page_to_keep()?,
        })
    }
}

impl Drop for Vacuum {
    fn drop(&mut self) {
        if self.thread.get_mut().is_some() {
            if let Err(err) = self.stop() {
                warn!(error = %err, "vacuum.drop.stop_failed");
            }
        }
    }
}

fn master_loop(
    master: Arc<Mutex<VacuumMaster>>,
    pool: WorkerPool,
    lifecycle: Arc<Lifecycle>,
    wakeup: Arc<MasterWakeup>,
    interval: Duration,
) -> Result<()> {
    info!("vacuum.master.started");
    let mut outcome = Ok(());
    while !lifecycle.is_shutdown_requested() {
        let result = master.lock().run_iteration(&pool);
        if let Err(err) = result {
            if err.is_fatal() {
                error!(error = %err, "vacuum.master.fatal");
                outcome = Err(err);
                break;
            }
            warn!(error = %err, "vacuum.master.iteration_failed");
        }
        wakeup.wait(interval);
    }
    let unstarted = pool.shutdown(|| {
        if let Err(err) = master.lock().refresh() {
            warn!(error = %err, "vacuum.master.drain_failed");
        }
    });
    let mut master = master.lock();
    master.abandon(&unstarted)?;
    master.refresh()?;
    lifecycle.register_shutdown();
    info!(unstarted = unstarted.len(), "vacuum.master.stopped");
    outcome
}
