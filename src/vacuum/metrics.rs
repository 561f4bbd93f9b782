use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::storage::{HeapPageOutcome, VacuumOutcome};

/// Observer of vacuum progress.
///
/// Called from the master and from every worker thread, so implementations
/// must be cheap and thread-safe.
pub trait VacuumMetrics: Send + Sync {
    /// Block summaries were appended to vacuum data.
    fn blocks_consumed(&self, count: u64);

    /// A job was handed to a worker.
    fn block_dispatched(&self);

    /// A job finished with nothing left to do in its block.
    fn block_vacuumed(&self);

    /// A job was cut short and its block will be retried.
    fn block_interrupted(&self);

    /// One heap page was vacuumed.
    fn heap_page(&self, outcome: &HeapPageOutcome);

    /// One index entry was vacuumed.
    fn index_entry(&self, outcome: VacuumOutcome);

    /// A log record was skipped because its file was dropped.
    fn dropped_skip(&self);

    /// A vacuum data page was allocated.
    fn data_page_allocated(&self);

    /// A vacuum data page was freed.
    fn data_page_freed(&self);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl VacuumMetrics for NoopMetrics {
    fn blocks_consumed(&self, _count: u64) {}
    fn block_dispatched(&self) {}
    fn block_vacuumed(&self) {}
    fn block_interrupted(&self) {}
    fn heap_page(&self, _outcome: &HeapPageOutcome) {}
    fn index_entry(&self, _outcome: VacuumOutcome) {}
    fn dropped_skip(&self) {}
    fn data_page_allocated(&self) {}
    fn data_page_freed(&self) {}
}

/// Atomic counters for every [`VacuumMetrics`] event.
#[derive(Default)]
pub struct CounterMetrics {
    /// Block summaries appended to vacuum data.
    pub blocks_consumed: AtomicU64,
    /// Jobs handed to workers.
    pub blocks_dispatched: AtomicU64,
    /// Jobs that vacuumed their block.
    pub blocks_vacuumed: AtomicU64,
    /// Jobs cut short.
    pub blocks_interrupted: AtomicU64,
    /// Heap records removed.
    pub heap_removed: AtomicU64,
    /// Heap insertion markers stripped.
    pub heap_stripped: AtomicU64,
    /// Index entries removed.
    pub index_removed: AtomicU64,
    /// Index insertion markers cleared.
    pub index_stripped: AtomicU64,
    /// Records skipped because their file was dropped.
    pub dropped_skips: AtomicU64,
    /// Vacuum data pages allocated.
    pub data_pages_allocated: AtomicU64,
    /// Vacuum data pages freed.
    pub data_pages_freed: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    /// Block summaries appended to vacuum data.
    pub blocks_consumed: u64,
    /// Jobs handed to workers.
    pub blocks_dispatched: u64,
    /// Jobs that vacuumed their block.
    pub blocks_vacuumed: u64,
    /// Jobs cut short.
    pub blocks_interrupted: u64,
    /// Heap records removed.
    pub heap_removed: u64,
    /// Heap insertion markers stripped.
    pub heap_stripped: u64,
    /// Index entries removed.
    pub index_removed: u64,
    /// Index insertion markers cleared.
    pub index_stripped: u64,
    /// Records skipped because their file was dropped.
    pub dropped_skips: u64,
    /// Vacuum data pages allocated.
    pub data_pages_allocated: u64,
    /// Vacuum data pages freed.
    pub data_pages_freed: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> CounterSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            blocks_consumed: load(&self.blocks_consumed),
            blocks_dispatched: load(&self.blocks_dispatched),
            blocks_vacuumed: load(&self.blocks_vacuumed),
            blocks_interrupted: load(&self.blocks_interrupted),
            heap_removed: load(&self.heap_removed),
            heap_stripped: load(&self.heap_stripped),
            index_removed: load(&self.index_removed),
            index_stripped: load(&self.index_stripped),
            dropped_skips: load(&self.dropped_skips),
            data_pages_allocated: load(&self.data_pages_allocated),
            data_pages_freed: load(&self.data_pages_freed),
        }
    }
}

impl VacuumMetrics for CounterMetrics {
    fn blocks_consumed(&self, count: u64) {
        self.blocks_consumed.fetch_add(count, Ordering::Relaxed);
    }

    fn block_dispatched(&self) {
        self.blocks_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn block_vacuumed(&self) {
        self.blocks_vacuumed.fetch_add(1, Ordering::Relaxed);
    }

    fn block_interrupted(&self) {
        self.blocks_interrupted.fetch_add(1, Ordering::Relaxed);
    }

    fn heap_page(&self, outcome: &HeapPageOutcome) {
        self.heap_removed
            .fetch_add(outcome.removed as u64, Ordering::Relaxed);
        self.heap_stripped
            .fetch_add(outcome.stripped as u64, Ordering::Relaxed);
    }

    fn index_entry(&self, outcome: VacuumOutcome) {
        match outcome {
            VacuumOutcome::Removed => {
                self.index_removed.fetch_add(1, Ordering::Relaxed);
            }
            VacuumOutcome::Stripped => {
                self.index_stripped.fetch_add(1, Ordering::Relaxed);
            }
            VacuumOutcome::Kept | VacuumOutcome::Missing => {}
        }
    }

    fn dropped_skip(&self) {
        self.dropped_skips.fetch_add(1, Ordering::Relaxed);
    }

    fn data_page_allocated(&self) {
        self.data_pages_allocated.fetch_add(1, Ordering::Relaxed);
    }

    fn data_page_freed(&self) {
        self.data_pages_freed.fetch_add(1, Ordering::Relaxed);
    }
}
