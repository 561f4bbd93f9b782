//! Execution of one vacuum job.
//!
//! A job walks the MVCC operations of a single block newest first. Index
//! entries and external resources are handled as they are met. Heap slots
//! are collected, sorted and vacuumed one page at a time so each heap page
//! is latched once per job. Records living in overflow pages are vacuumed
//! one by one, and clearing their inserter is logged.

use std::cmp::Reverse;
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace, warn};

use super::data::page::VacuumDataEntry;
use super::dropped::{DroppedFileTracker, WorkerVersionGuard};
use super::metrics::VacuumMetrics;
use super::redo::VacuumRedo;
use super::Lifecycle;
use crate::log::{LogSource, MvccOpIter, MvccOpKind, MvccOpPayload};
use crate::mvcc::{is_record_removable, RecordHeader, VacuumDecision};
use crate::storage::{DecideFn, HeapPageOutcome, HeapStore, IndexStore};
use crate::types::{BlockId, FileId, Mvccid, PageId, RecordLocation, ReclaimError, Result, SlotId};

/// How a job ended.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum JobOutcome {
    /// Every operation of the block was handled.
    Vacuumed,
    /// The job stopped early; the block goes back to available.
    Interrupted,
}

/// Report a worker hands back to the master.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct FinishedJob {
    /// Block the job ran on.
    pub blockid: BlockId,
    /// Result of the job.
    pub outcome: JobOutcome,
}

/// One block handed to a worker.
#[derive(Copy, Clone, Debug)]
pub struct VacuumJob {
    /// Vacuum data entry of the block, as seen at dispatch.
    pub entry: VacuumDataEntry,
    /// Threshold the master computed before dispatching.
    pub oldest_visible: Mvccid,
}

/// Everything a worker reads or mutates while running jobs.
pub(crate) struct WorkerContext {
    pub(crate) log: Arc<dyn LogSource>,
    pub(crate) heap: Arc<dyn HeapStore>,
    pub(crate) index: Arc<dyn IndexStore>,
    pub(crate) dropped: Arc<DroppedFileTracker>,
    pub(crate) metrics: Arc<dyn VacuumMetrics>,
    pub(crate) lifecycle: Arc<Lifecycle>,
}

#[derive(Copy, Clone, Debug)]
struct HeapTarget {
    file: FileId,
    page: PageId,
    slot: SlotId,
    mvccid: Mvccid,
    overflow: Option<PageId>,
}

/// Runs `job` as worker `slot` and reports how it ended. Never fails: any
/// error is logged and turns the job into an interrupted one.
pub(crate) fn execute_job(ctx: &WorkerContext, slot: usize, job: &VacuumJob) -> FinishedJob {
    let blockid = job.entry.blockid;
    let outcome = match vacuum_block(ctx, slot, job) {
        Ok(()) => {
            ctx.metrics.block_vacuumed();
            debug!(blockid = blockid.0, slot, "vacuum.worker.block_vacuumed");
            JobOutcome::Vacuumed
        }
        Err(ReclaimError::Interrupted) => {
            ctx.metrics.block_interrupted();
            debug!(blockid = blockid.0, slot, "vacuum.worker.interrupted");
            JobOutcome::Interrupted
        }
        Err(err) => {
            ctx.metrics.block_interrupted();
            warn!(blockid = blockid.0, slot, error = %err, "vacuum.worker.job_failed");
            JobOutcome::Interrupted
        }
    };
    FinishedJob { blockid, outcome }
}

fn vacuum_block(ctx: &WorkerContext, slot: usize, job: &VacuumJob) -> Result<()> {
    let guard = ctx.dropped.register_worker(slot)?;
    let threshold = job.oldest_visible;
    let mut targets = Vec::new();
    for item in MvccOpIter::new(ctx.log.as_ref(), job.entry.blockid, job.entry.start_lsa) {
        ctx.lifecycle.check()?;
        let (lsa, op) = item?;
        guard.refresh();
        if ctx.dropped.is_dropped(op.file, op.mvccid)? {
            ctx.metrics.dropped_skip();
            trace!(file = op.file.0, mvccid = op.mvccid.0, %lsa, "vacuum.worker.dropped_skip");
            continue;
        }
        if op.mvccid >= threshold {
            return Err(ReclaimError::Corruption(
                "mvcc op is not older than the vacuum threshold",
            ));
        }
        match op.payload {
            MvccOpPayload::Heap { page, slot } => targets.push(HeapTarget {
                file: op.file,
                page,
                slot,
                mvccid: op.mvccid,
                overflow: None,
            }),
            MvccOpPayload::HeapOverflow {
                page,
                slot,
                overflow,
            } => targets.push(HeapTarget {
                file: op.file,
                page,
                slot,
                mvccid: op.mvccid,
                overflow: Some(overflow),
            }),
            MvccOpPayload::Index { key, object, .. } => {
                let outcome = if op.kind == MvccOpKind::IndexDelete {
                    let decide = |h: &RecordHeader| match is_record_removable(h, threshold) {
                        VacuumDecision::Remove => VacuumDecision::Remove,
                        _ => VacuumDecision::Keep,
                    };
                    ctx.index.vacuum_entry(op.file, &key, object, &decide)?
                } else {
                    let decide = |h: &RecordHeader| is_record_removable(h, threshold);
                    ctx.index.vacuum_entry(op.file, &key, object, &decide)?
                };
                ctx.metrics.index_entry(outcome);
                trace!(index = op.file.0, ?outcome, %lsa, "vacuum.worker.index_entry");
            }
            MvccOpPayload::External { resource } => {
                let removed = ctx.heap.remove_external(&resource)?;
                trace!(resource = %resource, removed, "vacuum.worker.external");
            }
        }
    }
    vacuum_heap(ctx, &guard, targets, threshold)
}

fn vacuum_heap(
    ctx: &WorkerContext,
    guard: &WorkerVersionGuard<'_>,
    mut targets: Vec<HeapTarget>,
    threshold: Mvccid,
) -> Result<()> {
    // Newest id first within a slot so the dedup keeps it.
    targets.sort_unstable_by_key(|t| (t.file, t.page, t.slot, Reverse(t.mvccid)));
    targets.dedup_by_key(|t| (t.file, t.page, t.slot));
    let decide = |h: &RecordHeader| is_record_removable(h, threshold);

    let mut rest = targets.as_slice();
    while let Some(head) = rest.first() {
        let len = rest
            .iter()
            .take_while(|t| t.file == head.file && t.page == head.page)
            .count();
        let (group, tail) = rest.split_at(len);
        rest = tail;

        ctx.lifecycle.check()?;
        guard.refresh();
        let mut slots: SmallVec<[SlotId; 16]> = SmallVec::new();
        for target in group {
            if ctx.dropped.is_dropped(target.file, target.mvccid)? {
                ctx.metrics.dropped_skip();
            } else if let Some(overflow) = target.overflow {
                vacuum_overflow(ctx, target, overflow, &decide)?;
            } else {
                slots.push(target.slot);
            }
        }
        if slots.is_empty() {
            continue;
        }
        let outcome = ctx.heap.vacuum_page(head.file, head.page, &slots, &decide)?;
        ctx.metrics.heap_page(&outcome);
        trace!(
            file = head.file.0,
            page = head.page.0,
            removed = outcome.removed,
            stripped = outcome.stripped,
            "vacuum.worker.heap_page"
        );
    }
    Ok(())
}

fn vacuum_overflow(
    ctx: &WorkerContext,
    target: &HeapTarget,
    overflow: PageId,
    decide: DecideFn<'_>,
) -> Result<()> {
    let home = RecordLocation::new(target.file, target.page, target.slot);
    let on_strip = |file: FileId, page: PageId| -> Result<()> {
        ctx.log
            .append_redo(&VacuumRedo::RemoveOverflowInsid { file, page })
            .map(|_| ())
    };
    let outcome = ctx.heap.vacuum_overflow(home, overflow, decide, &on_strip)?;
    let mut counts = HeapPageOutcome::default();
    counts.record(outcome);
    ctx.metrics.heap_page(&counts);
    trace!(
        file = home.file.0,
        overflow = overflow.0,
        ?outcome,
        "vacuum.worker.heap_overflow"
    );
    Ok(())
}
