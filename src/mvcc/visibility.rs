//! Visibility predicates over record headers.
//!
//! Every removal decision vacuum makes goes through [`is_record_removable`].
//! Readers and writers use [`satisfies_snapshot`] and [`satisfies_delete`];
//! uniqueness checks that must see uncommitted work use [`satisfies_dirty`].

use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::types::{Lsa, Mvccid, Result};

use super::snapshot::Snapshot;

const HAS_INS: u8 = 1;
const HAS_DEL: u8 = 1 << 1;
const HAS_PREV: u8 = 1 << 2;

/// MVCC fields of a heap record or index entry.
///
/// `ins_id == None` means the insertion is visible to everyone.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RecordHeader {
    /// Inserting transaction, until vacuum strips it.
    pub ins_id: Option<Mvccid>,
    /// Deleting transaction.
    pub del_id: Option<Mvccid>,
    /// Log position of the previous version.
    pub prev_version: Option<Lsa>,
}

impl RecordHeader {
    /// Header of a record freshly inserted by `id`.
    pub fn inserted(id: Mvccid) -> Self {
        Self {
            ins_id: Some(id),
            del_id: None,
            prev_version: None,
        }
    }

    /// Same header with a deleter set.
    pub fn deleted_by(mut self, id: Mvccid) -> Self {
        self.del_id = Some(id);
        self
    }

    /// Same header with a previous-version link.
    pub fn with_prev_version(mut self, lsa: Lsa) -> Self {
        self.prev_version = Some(lsa);
        self
    }

    /// Drops the insertion marker and previous-version link.
    pub fn strip_insertion_marker(&mut self) {
        self.ins_id = None;
        self.prev_version = None;
    }

    /// Appends the header as a flag byte followed by the present fields.
    pub fn encode(&self, w: &mut ByteWriter) {
        let mut flags = 0;
        if self.ins_id.is_some() {
            flags |= HAS_INS;
        }
        if self.del_id.is_some() {
            flags |= HAS_DEL;
        }
        if self.prev_version.is_some() {
            flags |= HAS_PREV;
        }
        w.put_u8(flags);
        if let Some(id) = self.ins_id {
            w.put_u64(id.0);
        }
        if let Some(id) = self.del_id {
            w.put_u64(id.0);
        }
        if let Some(lsa) = self.prev_version {
            w.put_lsa(lsa);
        }
    }

    /// Reads a header written by [`RecordHeader::encode`].
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let flags = r.u8()?;
        let ins_id = if flags & HAS_INS != 0 {
            Some(Mvccid(r.u64()?))
        } else {
            None
        };
        let del_id = if flags & HAS_DEL != 0 {
            Some(Mvccid(r.u64()?))
        } else {
            None
        };
        let prev_version = if flags & HAS_PREV != 0 {
            Some(r.lsa()?)
        } else {
            None
        };
        Ok(Self {
            ins_id,
            del_id,
            prev_version,
        })
    }
}

/// Outcome of the vacuum predicate.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum VacuumDecision {
    /// The deleter is older than every reader: drop the record.
    Remove,
    /// The inserter is older than every reader and nobody deleted it.
    StripInsertionMarker,
    /// Some reader may still need the record as it is.
    Keep,
}

/// Decides what vacuum may do with a record given the oldest visible id.
pub fn is_record_removable(header: &RecordHeader, oldest_visible: Mvccid) -> VacuumDecision {
    match header.del_id {
        Some(del) if del < oldest_visible => VacuumDecision::Remove,
        _ => match header.ins_id {
            Some(ins) if ins < oldest_visible => VacuumDecision::StripInsertionMarker,
            _ => VacuumDecision::Keep,
        },
    }
}

/// Whether a record version belongs in a snapshot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SnapshotVisibility {
    /// Visible to the snapshot.
    Satisfied,
    /// Inserted by a transaction the snapshot does not see.
    TooNew,
    /// Deleted by a transaction the snapshot sees.
    TooOld,
}

fn is_own(own: &[Mvccid], id: Mvccid) -> bool {
    own.contains(&id)
}

/// Checks a record version against a reader snapshot.
pub fn satisfies_snapshot(
    header: &RecordHeader,
    snapshot: &Snapshot,
    own: &[Mvccid],
) -> SnapshotVisibility {
    match header.ins_id {
        None => match header.del_id {
            None => SnapshotVisibility::Satisfied,
            Some(del) if is_own(own, del) => SnapshotVisibility::TooOld,
            Some(del) if snapshot.is_active(del) => SnapshotVisibility::Satisfied,
            Some(_) => SnapshotVisibility::TooOld,
        },
        Some(ins) if is_own(own, ins) => match header.del_id {
            Some(del) if is_own(own, del) => SnapshotVisibility::TooOld,
            _ => SnapshotVisibility::Satisfied,
        },
        Some(ins) if snapshot.is_active(ins) => SnapshotVisibility::TooNew,
        Some(_) => match header.del_id {
            None => SnapshotVisibility::Satisfied,
            Some(del) if is_own(own, del) => SnapshotVisibility::TooOld,
            Some(del) if snapshot.is_active(del) => SnapshotVisibility::Satisfied,
            Some(_) => SnapshotVisibility::TooOld,
        },
    }
}

/// True when the record was not deleted as far as `snapshot` can tell.
pub fn is_not_deleted_for_snapshot(
    header: &RecordHeader,
    snapshot: &Snapshot,
    own: &[Mvccid],
) -> bool {
    match header.del_id {
        None => true,
        Some(del) if is_own(own, del) => false,
        Some(del) => snapshot.is_active(del),
    }
}

/// Whether a writer may delete or update a record.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DeleteVisibility {
    /// The latest version can be deleted.
    CanDelete,
    /// Its inserter has not completed yet.
    InsertInProgress,
    /// This transaction already deleted it.
    SelfDeleted,
    /// Another active transaction deleted it.
    DeleteInProgress,
    /// A completed transaction deleted it.
    Deleted,
}

/// Checks whether the transaction owning `own` may delete the record.
///
/// `is_active` answers for the current state of the transaction table.
pub fn satisfies_delete(
    header: &RecordHeader,
    own: &[Mvccid],
    is_active: impl Fn(Mvccid) -> bool,
) -> DeleteVisibility {
    if let Some(ins) = header.ins_id {
        if !is_own(own, ins) && is_active(ins) {
            return DeleteVisibility::InsertInProgress;
        }
    }
    match header.del_id {
        None => DeleteVisibility::CanDelete,
        Some(del) if is_own(own, del) => DeleteVisibility::SelfDeleted,
        Some(del) if is_active(del) => DeleteVisibility::DeleteInProgress,
        Some(_) => DeleteVisibility::Deleted,
    }
}

/// Outcome of a dirty read of a record version.
///
/// The in-progress ids are set only when the version is visible because of
/// a transaction that has not completed, so the caller can wait on it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DirtyVisibility {
    /// Whether the version is visible, counting uncommitted work.
    pub visibility: SnapshotVisibility,
    /// Another active transaction inserted the version.
    pub inserter_in_progress: Option<Mvccid>,
    /// Another active transaction deleted the version.
    pub deleter_in_progress: Option<Mvccid>,
}

impl DirtyVisibility {
    fn settled(visibility: SnapshotVisibility) -> Self {
        Self {
            visibility,
            inserter_in_progress: None,
            deleter_in_progress: None,
        }
    }
}

/// Checks a record version against committed and in-progress transactions.
///
/// Uncommitted inserts are visible and uncommitted deletes by others are
/// not yet effective. Deletes by `own` or by a completed transaction make
/// the version [`SnapshotVisibility::TooOld`].
pub fn satisfies_dirty(
    header: &RecordHeader,
    own: &[Mvccid],
    is_active: impl Fn(Mvccid) -> bool,
) -> DirtyVisibility {
    match header.del_id {
        None => match header.ins_id {
            Some(ins) if !is_own(own, ins) && is_active(ins) => DirtyVisibility {
                inserter_in_progress: Some(ins),
                ..DirtyVisibility::settled(SnapshotVisibility::Satisfied)
            },
            _ => DirtyVisibility::settled(SnapshotVisibility::Satisfied),
        },
        Some(del) if is_own(own, del) => DirtyVisibility::settled(SnapshotVisibility::TooOld),
        Some(del) if is_active(del) => DirtyVisibility {
            deleter_in_progress: Some(del),
            ..DirtyVisibility::settled(SnapshotVisibility::Satisfied)
        },
        Some(_) => DirtyVisibility::settled(SnapshotVisibility::TooOld),
    }
}
