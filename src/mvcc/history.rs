use crate::primitives::concurrency::SeqRing;
use crate::types::Mvccid;

use super::bitmap::ActiveTxBitmap;

/// What produced a history slot.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CompletionEvent {
    /// Initial slot or explicit reset.
    Reset,
    /// A transaction committed.
    Commit,
    /// A transaction rolled back.
    Rollback,
    /// A sub-transaction committed.
    SubCommit,
    /// A sub-transaction rolled back.
    SubRollback,
}

impl CompletionEvent {
    pub(crate) fn of(committed: bool, sub: bool) -> Self {
        match (committed, sub) {
            (true, false) => CompletionEvent::Commit,
            (false, false) => CompletionEvent::Rollback,
            (true, true) => CompletionEvent::SubCommit,
            (false, true) => CompletionEvent::SubRollback,
        }
    }
}

/// One immutable copy of the transaction states.
#[derive(Clone, Debug)]
pub struct TransStatus {
    /// Active transactions as of this slot.
    pub bitmap: ActiveTxBitmap,
    /// Id whose completion produced this slot.
    pub last_completed: Mvccid,
    /// Kind of that completion.
    pub event: CompletionEvent,
}

impl TransStatus {
    fn fresh(start_id: Mvccid, high_water_units: usize) -> Self {
        Self {
            bitmap: ActiveTxBitmap::new(start_id, high_water_units),
            last_completed: Mvccid::NULL,
            event: CompletionEvent::Reset,
        }
    }
}

/// Versioned history of [`TransStatus`] copies, read without blocking writers.
pub struct SnapshotHistory {
    ring: SeqRing<TransStatus>,
}

impl SnapshotHistory {
    /// History whose current slot has every id from `start_id` active.
    pub fn new(len: usize, start_id: Mvccid, high_water_units: usize) -> Self {
        Self {
            ring: SeqRing::new(len, || TransStatus::fresh(start_id, high_water_units)),
        }
    }

    /// Number of versioned slots.
    pub fn len(&self) -> usize {
        self.ring.len()
    }

    /// Always false; the ring holds at least two slots.
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Copies the current bitmap into `dest`. A copy that raced a writer is
    /// thrown away and redone from scratch.
    pub fn copy_current(&self, dest: &mut ActiveTxBitmap) {
        self.ring.read(|status| status.bitmap.copy_to(dest));
    }

    /// Runs `f` on a consistent view of the current slot.
    pub fn read<R>(&self, f: impl FnMut(&TransStatus) -> R) -> R {
        self.ring.read(f)
    }

    /// Publishes a new slot recording the completion of `id`. Returns the
    /// lowest active id of the new slot.
    pub fn complete(&self, id: Mvccid, event: CompletionEvent) -> Mvccid {
        let mut lowest = Mvccid::NULL;
        self.ring.publish(|current, next| {
            current.bitmap.copy_to(&mut next.bitmap);
            next.bitmap.set_inactive(id);
            next.last_completed = id;
            next.event = event;
            lowest = next.bitmap.compute_lowest_active();
        });
        lowest
    }

    /// Publishes an empty slot starting at `start_id`.
    pub fn reset(&self, start_id: Mvccid) {
        self.ring.publish(|_, next| {
            next.bitmap.reset(start_id);
            next.last_completed = Mvccid::NULL;
            next.event = CompletionEvent::Reset;
        });
    }
}
