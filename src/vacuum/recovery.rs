//! Crash recovery of the durable vacuum files.
//!
//! Redo records are replayed into both stores first. Block summaries that
//! were sitting in the production queue are volatile and get rebuilt by
//! walking the previous-operation links backwards from the newest MVCC
//! operation of the log.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use super::redo::RedoStores;
use crate::log::{BlockSummary, LogPage, LogRecord, LogSource};
use crate::types::{BlockId, Lsa, Result};

/// Counts of redo records seen during replay.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReplayReport {
    /// Records applied to a page that did not reflect them yet.
    pub applied: usize,
    /// Records the target page already reflected.
    pub skipped: usize,
}

/// Replays every vacuum redo record logged from `start` into `stores`.
///
/// Must run before the data chain or the dropped files tracker are opened
/// on the stores: opening an empty store creates a fresh chain whose redo
/// would hide the replayed one.
pub fn notify_server_crashed(
    log: &dyn LogSource,
    stores: RedoStores<'_>,
    start: Lsa,
) -> Result<ReplayReport> {
    let mut report = ReplayReport::default();
    for (lsa, record) in log.records_from(start)? {
        let LogRecord::Vacuum(redo) = record else {
            continue;
        };
        if stores.replay(&redo, lsa)? {
            report.applied += 1;
        } else {
            report.skipped += 1;
        }
    }
    info!(
        start = %start,
        applied = report.applied,
        skipped = report.skipped,
        "vacuum.recovery.replayed"
    );
    Ok(report)
}

/// Summaries of sealed blocks newer than `last_durable`, oldest first.
///
/// The block holding the append position is still open and left to the
/// log, which seals it later.
pub(crate) fn rebuild_lost_blocks(
    log: &dyn LogSource,
    last_durable: Option<BlockId>,
) -> Result<Vec<BlockSummary>> {
    let ppb = log.pages_per_block();
    let open = log.append_block();
    let mut blocks: BTreeMap<BlockId, BlockSummary> = BTreeMap::new();
    let mut cached: Option<Arc<LogPage>> = None;
    let mut next = log.last_mvcc_op();
    while let Some(lsa) = next {
        let blockid = BlockId::of_page(lsa.page, ppb);
        if last_durable.is_some_and(|last| blockid <= last) {
            break;
        }
        let page = match &cached {
            Some(page) if page.id() == lsa.page => Arc::clone(page),
            _ => {
                let page = log.fetch_page(lsa.page)?;
                cached = Some(Arc::clone(&page));
                page
            }
        };
        let op = page.mvcc_op_at(lsa.offset)?;
        if blockid != open {
            blocks
                .entry(blockid)
                .and_modify(|s| {
                    s.oldest_mvccid = s.oldest_mvccid.min(op.mvccid);
                    s.newest_mvccid = s.newest_mvccid.max(op.mvccid);
                })
                .or_insert(BlockSummary {
                    blockid,
                    start_lsa: lsa,
                    oldest_mvccid: op.mvccid,
                    newest_mvccid: op.mvccid,
                });
        }
        next = op.prev_mvcc_op.filter(|prev| *prev < lsa);
    }
    debug!(
        rebuilt = blocks.len(),
        last_durable = ?last_durable,
        "vacuum.recovery.rebuilt_blocks"
    );
    Ok(blocks.into_values().collect())
}
