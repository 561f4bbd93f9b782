#![forbid(unsafe_code)]

//! Heap and index storage as vacuum sees it.
//!
//! Vacuum never interprets record bodies. It hands each store a page or an
//! entry together with a decision function built from the current oldest
//! visible id, and the store applies the decision to the MVCC header it
//! finds there under its own latch.

mod heap;
mod index;

use serde::Serialize;

use crate::mvcc::{RecordHeader, VacuumDecision};
use crate::types::{FileId, PageId, RecordLocation, Result, SlotId};

pub use heap::MemHeap;
pub use index::{IndexEntry, MemIndex};

/// Decision function applied to one MVCC header.
pub type DecideFn<'a> = &'a dyn Fn(&RecordHeader) -> VacuumDecision;

/// Called while an overflow page is still latched, right after its
/// insertion marker was cleared. Logs the change.
pub type StripHook<'a> = &'a dyn Fn(FileId, PageId) -> Result<()>;

/// What happened to a single record or index entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VacuumOutcome {
    /// The record was physically removed.
    Removed,
    /// The insertion marker and previous version link were cleared.
    Stripped,
    /// Left as it was.
    Kept,
    /// Nothing lives at the location anymore.
    Missing,
}

/// Per-page counts returned by [`HeapStore::vacuum_page`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct HeapPageOutcome {
    /// Records removed.
    pub removed: u32,
    /// Records whose insertion marker was stripped.
    pub stripped: u32,
    /// Records left untouched.
    pub kept: u32,
    /// Slots that held no record.
    pub missing: u32,
}

impl HeapPageOutcome {
    /// Counts one outcome.
    pub fn record(&mut self, outcome: VacuumOutcome) {
        match outcome {
            VacuumOutcome::Removed => self.removed += 1,
            VacuumOutcome::Stripped => self.stripped += 1,
            VacuumOutcome::Kept => self.kept += 1,
            VacuumOutcome::Missing => self.missing += 1,
        }
    }
}

/// Heap storage consumed by vacuum workers.
pub trait HeapStore: Send + Sync + 'static {
    /// Latches `page` of `file` exclusively once and applies `decide` to
    /// every listed slot. Removing an already removed record counts as
    /// missing, so running the same page twice is harmless.
    fn vacuum_page(
        &self,
        file: FileId,
        page: PageId,
        slots: &[SlotId],
        decide: DecideFn<'_>,
    ) -> Result<HeapPageOutcome>;

    /// Applies `decide` to a record stored in overflow pages.
    ///
    /// The header lives on the first overflow page. Removing drops the home
    /// slot and the overflow chain. Stripping only clears the inserter, and
    /// `on_strip` runs before the overflow page is released.
    fn vacuum_overflow(
        &self,
        home: RecordLocation,
        overflow: PageId,
        decide: DecideFn<'_>,
        on_strip: StripHook<'_>,
    ) -> Result<VacuumOutcome>;

    /// Clears the inserter on the first overflow page during recovery.
    /// Returns false when there was nothing to clear.
    fn redo_remove_overflow_insid(&self, file: FileId, overflow: PageId) -> Result<bool>;

    /// Every live record with its MVCC header.
    fn scan(&self) -> Result<Vec<(RecordLocation, RecordHeader)>>;

    /// Deletes a resource kept in external storage. Returns false when it
    /// was already gone.
    fn remove_external(&self, resource: &str) -> Result<bool>;
}

/// Index storage consumed by vacuum workers.
pub trait IndexStore: Send + Sync + 'static {
    /// Latches the entry `(key, object)` of `index` and applies `decide`
    /// to its current header.
    fn vacuum_entry(
        &self,
        index: FileId,
        key: &[u8],
        object: RecordLocation,
        decide: DecideFn<'_>,
    ) -> Result<VacuumOutcome>;

    /// Every live entry.
    fn scan(&self) -> Result<Vec<IndexEntry>>;
}

/// Applies a non-removing `decision` to `header` in place. The caller drops
/// the record itself on [`VacuumOutcome::Removed`].
pub(crate) fn apply_decision(header: &mut RecordHeader, decision: VacuumDecision) -> VacuumOutcome {
    match decision {
        VacuumDecision::Remove => VacuumOutcome::Removed,
        VacuumDecision::StripInsertionMarker => {
            header.strip_insertion_marker();
            VacuumOutcome::Stripped
        }
        VacuumDecision::Keep => VacuumOutcome::Kept,
    }
}
