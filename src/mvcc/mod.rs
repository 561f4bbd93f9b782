#![forbid(unsafe_code)]

//! Transaction id tracking and visibility.
//!
//! [`MvccTable`] hands out ids, records completions into a versioned
//! [`SnapshotHistory`] of [`ActiveTxBitmap`] copies and derives the oldest
//! id any reader may still need. Readers copy the current history slot into
//! their own [`Snapshot`] without ever blocking a completing writer.

mod bitmap;
mod history;
mod snapshot;
mod table;
pub mod visibility;

pub use bitmap::ActiveTxBitmap;
pub use history::{CompletionEvent, SnapshotHistory, TransStatus};
pub use snapshot::Snapshot;
pub use table::{MvccTable, MvccTableStats, MvccTx};
pub use visibility::{
    is_not_deleted_for_snapshot, is_record_removable, satisfies_delete, satisfies_dirty,
    satisfies_snapshot, DeleteVisibility, DirtyVisibility, RecordHeader, SnapshotVisibility,
    VacuumDecision,
};
