//! The master loop: keeps vacuum data current and dispatches ready blocks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info, trace};

use super::cursor::VacuumJobCursor;
use super::data::VacuumData;
use super::dropped::DroppedFileTracker;
use super::metrics::VacuumMetrics;
use super::recovery;
use super::worker::{execute_job, FinishedJob, JobOutcome, VacuumJob, WorkerContext};
use crate::log::{BlockSummary, LogSource};
use crate::mvcc::MvccTable;
use crate::primitives::concurrency::BoundedQueue;
use crate::types::{BlockId, Mvccid, ReclaimError, Result};

/// Destination of dispatched jobs.
pub(crate) trait JobSink {
    /// True when no more jobs should be handed out this round.
    fn is_saturated(&self) -> bool;

    /// Takes ownership of `job`.
    fn submit(&self, job: VacuumJob) -> Result<()>;
}

/// Runs each job on the calling thread, in a slot of its own.
pub(crate) struct InlineExecutor<'a> {
    pub(crate) ctx: &'a WorkerContext,
    pub(crate) slot: usize,
    pub(crate) finished: &'a BoundedQueue<FinishedJob>,
}

impl JobSink for InlineExecutor<'_> {
    fn is_saturated(&self) -> bool {
        self.finished.is_half_full()
    }

    fn submit(&self, job: VacuumJob) -> Result<()> {
        let done = execute_job(self.ctx, self.slot, &job);
        self.finished
            .push(done)
            .map_err(|_| ReclaimError::QueueFull(self.finished.name()))
    }
}

/// What one master iteration did.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub(crate) struct IterationReport {
    pub(crate) consumed: usize,
    pub(crate) finished: usize,
    pub(crate) interrupted: usize,
    pub(crate) dispatched: usize,
}

/// State owned by whoever runs master iterations.
pub(crate) struct VacuumMaster {
    data: VacuumData,
    cursor: VacuumJobCursor,
    table: Arc<MvccTable>,
    log: Arc<dyn LogSource>,
    production: Arc<BoundedQueue<BlockSummary>>,
    finished: Arc<BoundedQueue<FinishedJob>>,
    dropped: Arc<DroppedFileTracker>,
    metrics: Arc<dyn VacuumMetrics>,
    oldest_unvacuumed: Arc<AtomicU64>,
    tail_margin: u64,
}

impl VacuumMaster {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        data: VacuumData,
        table: Arc<MvccTable>,
        log: Arc<dyn LogSource>,
        production: Arc<BoundedQueue<BlockSummary>>,
        finished: Arc<BoundedQueue<FinishedJob>>,
        dropped: Arc<DroppedFileTracker>,
        metrics: Arc<dyn VacuumMetrics>,
        oldest_unvacuumed: Arc<AtomicU64>,
        tail_margin: u64,
    ) -> Self {
        oldest_unvacuumed.store(data.oldest_unvacuumed().0, Ordering::Release);
        Self {
            data,
            cursor: VacuumJobCursor::new(BlockId(0)),
            table,
            log,
            production,
            finished,
            dropped,
            metrics,
            oldest_unvacuumed,
            tail_margin,
        }
    }

    pub(crate) fn data(&self) -> &VacuumData {
        &self.data
    }

    /// One pass: refresh vacuum data, then dispatch every ready block in
    /// order until one is not ready or `sink` is saturated.
    pub(crate) fn run_iteration(&mut self, sink: &dyn JobSink) -> Result<IterationReport> {
        let oldest_visible = self.table.update_global_oldest_visible();
        let mut report = IterationReport::default();
        self.update(oldest_visible, &mut report)?;

        let append_page = self.log.append_lsa().page;
        if !self.cursor.load(&self.data)? {
            return Ok(report);
        }
        while let Some(entry) = self.cursor.entry()? {
            if entry.is_available() {
                if entry.newest_mvccid >= oldest_visible
                    || entry.start_lsa.page + self.tail_margin > append_page
                {
                    trace!(
                        blockid = entry.blockid.0,
                        newest = entry.newest_mvccid.0,
                        oldest_visible = oldest_visible.0,
                        "vacuum.master.not_ready"
                    );
                    break;
                }
                if sink.is_saturated() {
                    self.update(oldest_visible, &mut report)?;
                    if sink.is_saturated() || !self.cursor.load(&self.data)? {
                        break;
                    }
                    continue;
                }
                self.cursor.set_in_progress(&self.data)?;
                sink.submit(VacuumJob {
                    entry,
                    oldest_visible,
                })?;
                self.metrics.block_dispatched();
                report.dispatched += 1;
                trace!(blockid = entry.blockid.0, "vacuum.master.dispatched");
                if self.production.is_half_full() || self.finished.is_half_full() {
                    self.update(oldest_visible, &mut report)?;
                    if !self.cursor.load(&self.data)? {
                        break;
                    }
                    continue;
                }
            }
            if !self.cursor.increment(&self.data)? {
                break;
            }
        }
        debug!(
            oldest_visible = oldest_visible.0,
            consumed = report.consumed,
            finished = report.finished,
            dispatched = report.dispatched,
            "vacuum.master.iteration"
        );
        Ok(report)
    }

    /// Applies finished jobs and new summaries, then recomputes the oldest
    /// unvacuumed id with the threshold of the current iteration.
    pub(crate) fn refresh(&mut self) -> Result<IterationReport> {
        let oldest_visible = self.table.update_global_oldest_visible();
        let mut report = IterationReport::default();
        self.update(oldest_visible, &mut report)?;
        Ok(report)
    }

    /// Finishes recovery once redo was replayed and the chain reopened:
    /// entries left in progress become available again and summaries lost
    /// with the production queue are rebuilt from the log.
    pub(crate) fn recover_after_crash(&mut self) -> Result<usize> {
        let reset = self.data.reset_in_progress_after_crash()?;
        let mut summaries = recovery::rebuild_lost_blocks(
            self.log.as_ref(),
            self.data.get_last_blockid(),
        )?;
        self.production.drain_into(&mut summaries);
        summaries.sort_by_key(|s| s.blockid);
        summaries.dedup_by_key(|s| s.blockid);
        let rebuilt = self.data.consume(summaries, true)?;
        self.cursor.readjust_after_data_change(&self.data)?;
        self.flush()?;
        info!(reset, rebuilt, "vacuum.recovery.done");
        Ok(rebuilt)
    }

    /// Hands the blocks of jobs that never started back as interrupted.
    pub(crate) fn abandon(&mut self, jobs: &[VacuumJob]) -> Result<()> {
        let finished: Vec<FinishedJob> = jobs
            .iter()
            .map(|job| FinishedJob {
                blockid: job.entry.blockid,
                outcome: JobOutcome::Interrupted,
            })
            .collect();
        self.apply_finished(finished)?;
        self.flush()
    }

    fn update(&mut self, oldest_visible: Mvccid, report: &mut IterationReport) -> Result<()> {
        let mut finished = Vec::new();
        self.finished.drain_into(&mut finished);
        report.finished += finished.len();
        report.interrupted += self.apply_finished(finished)?;

        // Read before draining so a block sealed in between is still counted.
        let open_oldest = self.log.open_block_oldest();
        report.consumed += self.data.consume_produced_blocks(&self.production, false)?;
        let oldest = self.data.update_oldest_unvacuumed(oldest_visible, open_oldest)?;
        self.oldest_unvacuumed.store(oldest.0, Ordering::Release);
        self.dropped.cleanup(oldest)?;
        self.cursor.readjust_after_data_change(&self.data)?;
        self.flush()
    }

    fn apply_finished(&mut self, finished: Vec<FinishedJob>) -> Result<usize> {
        if finished.is_empty() {
            return Ok(0);
        }
        let interrupted: Vec<BlockId> = finished
            .iter()
            .filter(|job| job.outcome == JobOutcome::Interrupted)
            .map(|job| job.blockid)
            .collect();
        let rewind = interrupted.iter().min().copied();
        self.data.mark_finished(&finished)?;
        if let Some(blockid) = rewind {
            if blockid < self.cursor.blockid() {
                debug!(blockid = blockid.0, "vacuum.master.rewind");
                self.cursor = VacuumJobCursor::new(blockid);
            }
        }
        self.cursor.readjust_after_data_change(&self.data)?;
        Ok(interrupted.len())
    }

    fn flush(&self) -> Result<()> {
        self.data.store().flush()?;
        self.dropped.flush()
    }
}
