use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::Mutex;
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::options::MvccOptions;
use crate::types::{Mvccid, ReclaimError, Result};

use super::history::{CompletionEvent, SnapshotHistory};
use super::snapshot::Snapshot;

/// Slot value of a transaction that published no floor.
const FLOOR_NONE: u64 = 0;
/// Slot value while a transaction is computing its floor.
const FLOOR_PENDING: u64 = u64::MAX;

/// Issues transaction ids, tracks which are active and derives the oldest id
/// any reader may still need.
pub struct MvccTable {
    opts: MvccOptions,
    next_id: Mutex<Mvccid>,
    history: SnapshotHistory,
    lowest_active: AtomicU64,
    oldest_visible: AtomicU64,
    floors: Box<[CachePadded<AtomicU64>]>,
    free_slots: Mutex<Vec<usize>>,
}

/// Counters describing the table, for diagnostics.
#[derive(Clone, Debug, Serialize)]
pub struct MvccTableStats {
    /// Next id that will be handed out.
    pub next_id: Mvccid,
    /// Lowest active id as last published.
    pub lowest_active: Mvccid,
    /// Last threshold returned by [`MvccTable::update_global_oldest_visible`].
    pub oldest_visible: Mvccid,
    /// Registered transactions.
    pub live_transactions: usize,
    /// Active ids that left the bitmap window.
    pub long_transactions: usize,
}

impl MvccTable {
    /// Fresh table handing out ids from [`Mvccid::FIRST`].
    pub fn new(opts: MvccOptions) -> Arc<Self> {
        Self::with_next_id(opts, Mvccid::FIRST)
    }

    /// Table handing out ids from `next_id`, as after recovery.
    pub fn with_next_id(opts: MvccOptions, next_id: Mvccid) -> Arc<Self> {
        let opts = opts.normalize();
        let floors = (0..opts.max_transactions)
            .map(|_| CachePadded::new(AtomicU64::new(FLOOR_NONE)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let free_slots = (0..opts.max_transactions).rev().collect();
        Arc::new(Self {
            history: SnapshotHistory::new(
                opts.history_len,
                next_id,
                opts.bitmap_high_water_units,
            ),
            next_id: Mutex::new(next_id),
            lowest_active: AtomicU64::new(next_id.0),
            oldest_visible: AtomicU64::new(next_id.0),
            floors,
            free_slots: Mutex::new(free_slots),
            opts,
        })
    }

    /// Options the table was built with, after normalization.
    pub fn options(&self) -> &MvccOptions {
        &self.opts
    }

    /// Registers a transaction. Fails when every slot is taken.
    pub fn begin(self: &Arc<Self>) -> Result<MvccTx> {
        let slot = self
            .free_slots
            .lock()
            .pop()
            .ok_or(ReclaimError::OutOfSpace("transaction table full"))?;
        self.floors[slot].store(FLOOR_NONE, Ordering::SeqCst);
        Ok(MvccTx {
            table: Arc::clone(self),
            slot,
            id: None,
            sub_ids: SmallVec::new(),
            snapshot: None,
        })
    }

    /// Takes the next id.
    pub fn get_new_id(&self) -> Mvccid {
        let mut next = self.next_id.lock();
        let id = *next;
        *next = id.next();
        id
    }

    /// Takes two consecutive ids in one step.
    pub fn get_two_new_ids(&self) -> (Mvccid, Mvccid) {
        let mut next = self.next_id.lock();
        let first = *next;
        *next = first.next().next();
        (first, first.next())
    }

    /// Id the next call to [`MvccTable::get_new_id`] returns.
    pub fn peek_next_id(&self) -> Mvccid {
        *self.next_id.lock()
    }

    /// Builds (or refreshes) the snapshot of `tx`.
    ///
    /// The pending sentinel is published before the global lowest active id
    /// is read, so a concurrent threshold computation either waits for the
    /// real floor or starts after it is visible.
    pub fn build_snapshot<'t>(&self, tx: &'t mut MvccTx) -> &'t Snapshot {
        let floor = &self.floors[tx.slot];
        if floor.load(Ordering::SeqCst) == FLOOR_NONE {
            floor.store(FLOOR_PENDING, Ordering::SeqCst);
            let lowest = self.lowest_active.load(Ordering::SeqCst);
            floor.store(lowest, Ordering::SeqCst);
        }
        let high_water = self.opts.bitmap_high_water_units;
        let snapshot = tx
            .snapshot
            .get_or_insert_with(|| Snapshot::empty(high_water));
        self.history.copy_current(&mut snapshot.bitmap);
        snapshot.lowest_active = snapshot.bitmap.compute_lowest_active();
        snapshot.highest_completed = snapshot.bitmap.compute_highest_completed();
        trace!(
            slot = tx.slot,
            lowest = snapshot.lowest_active.0,
            highest = snapshot.highest_completed.0,
            "mvcc.snapshot.build"
        );
        snapshot
    }

    /// Drops the snapshot of `tx` and withdraws its floor.
    pub fn reset_snapshot(&self, tx: &mut MvccTx) {
        tx.snapshot = None;
        self.floors[tx.slot].store(FLOOR_NONE, Ordering::SeqCst);
    }

    /// Completes the id of `tx`, and before it every sub-transaction still
    /// active, with the same outcome. A transaction without an id only
    /// withdraws its floor.
    pub fn complete(&self, tx: &mut MvccTx, committed: bool) {
        let floor = &self.floors[tx.slot];
        let Some(id) = tx.id else {
            floor.store(FLOOR_NONE, Ordering::SeqCst);
            return;
        };
        let open_subs: SmallVec<[Mvccid; 4]> = tx
            .sub_ids
            .iter()
            .copied()
            .filter(|sub| self.is_active(*sub))
            .collect();
        for sub in open_subs {
            self.complete_sub(tx, sub, committed);
        }
        if committed && floor.load(Ordering::SeqCst) == FLOOR_NONE {
            // id is still active here, so this cannot undercut a threshold
            // already handed out.
            floor.store(id.0, Ordering::SeqCst);
        }
        let lowest = self
            .history
            .complete(id, CompletionEvent::of(committed, false));
        if committed {
            floor.fetch_max(id.0, Ordering::SeqCst);
        } else {
            floor.store(FLOOR_NONE, Ordering::SeqCst);
        }
        tx.snapshot = None;
        self.advance_lowest_active(id, lowest);
    }

    /// Completes a sub-transaction of `tx`; the parent stays active.
    pub fn complete_sub(&self, tx: &mut MvccTx, sub_id: Mvccid, committed: bool) {
        let lowest = self
            .history
            .complete(sub_id, CompletionEvent::of(committed, true));
        if !committed {
            tx.sub_ids.retain(|id| *id != sub_id);
        }
        self.advance_lowest_active(sub_id, lowest);
    }

    fn advance_lowest_active(&self, completed: Mvccid, lowest: Mvccid) {
        if completed.0 >= self.lowest_active.load(Ordering::SeqCst) {
            let prev = self.lowest_active.fetch_max(lowest.0, Ordering::SeqCst);
            if prev < lowest.0 {
                trace!(from = prev, to = lowest.0, "mvcc.lowest_active.advance");
            }
        }
    }

    /// True when `id` is active according to the current history slot.
    pub fn is_active(&self, id: Mvccid) -> bool {
        if id.0 < self.lowest_active.load(Ordering::Acquire) {
            return false;
        }
        self.history.read(|status| status.bitmap.is_active(id))
    }

    /// Minimum of the lowest active id and every published floor.
    ///
    /// Floors still pending are waited on with backoff.
    pub fn compute_global_oldest_visible(&self) -> Mvccid {
        let mut oldest = self.lowest_active.load(Ordering::SeqCst);
        for floor in self.floors.iter() {
            let backoff = Backoff::new();
            loop {
                let value = floor.load(Ordering::SeqCst);
                if value == FLOOR_PENDING {
                    if backoff.is_completed() {
                        thread::yield_now();
                    } else {
                        backoff.snooze();
                    }
                    continue;
                }
                if value != FLOOR_NONE && value < oldest {
                    oldest = value;
                }
                break;
            }
        }
        Mvccid(oldest)
    }

    /// Recomputes the threshold and returns it, never going backwards.
    pub fn update_global_oldest_visible(&self) -> Mvccid {
        let computed = self.compute_global_oldest_visible();
        let prev = self
            .oldest_visible
            .fetch_max(computed.0, Ordering::SeqCst);
        Mvccid(prev.max(computed.0))
    }

    /// Threshold as of the last [`MvccTable::update_global_oldest_visible`].
    pub fn oldest_visible(&self) -> Mvccid {
        Mvccid(self.oldest_visible.load(Ordering::SeqCst))
    }

    /// Restarts id tracking at `next_id`. Only valid with no live transactions.
    pub fn reset(&self, next_id: Mvccid) {
        let mut next = self.next_id.lock();
        *next = next_id;
        self.history.reset(next_id);
        self.lowest_active.store(next_id.0, Ordering::SeqCst);
        self.oldest_visible.store(next_id.0, Ordering::SeqCst);
        for floor in self.floors.iter() {
            floor.store(FLOOR_NONE, Ordering::SeqCst);
        }
        debug!(next_id = next_id.0, "mvcc.table.reset");
    }

    /// Diagnostic counters.
    pub fn stats(&self) -> MvccTableStats {
        let live = self.opts.max_transactions - self.free_slots.lock().len();
        MvccTableStats {
            next_id: self.peek_next_id(),
            lowest_active: Mvccid(self.lowest_active.load(Ordering::SeqCst)),
            oldest_visible: self.oldest_visible(),
            live_transactions: live,
            long_transactions: self
                .history
                .read(|status| status.bitmap.long_transactions().len()),
        }
    }

    fn release_slot(&self, slot: usize) {
        self.floors[slot].store(FLOOR_NONE, Ordering::SeqCst);
        self.free_slots.lock().push(slot);
    }
}

/// A registered transaction. Dropping it frees its slot.
pub struct MvccTx {
    table: Arc<MvccTable>,
    slot: usize,
    id: Option<Mvccid>,
    sub_ids: SmallVec<[Mvccid; 4]>,
    snapshot: Option<Snapshot>,
}

impl MvccTx {
    /// Id of the transaction, if it wrote anything yet.
    pub fn id(&self) -> Option<Mvccid> {
        self.id
    }

    /// Returns the id of the transaction, taking one on first use.
    pub fn assign_id(&mut self) -> Mvccid {
        match self.id {
            Some(id) => id,
            None => {
                let id = self.table.get_new_id();
                self.id = Some(id);
                id
            }
        }
    }

    /// Starts a sub-transaction and returns its id.
    pub fn begin_sub(&mut self) -> Mvccid {
        let sub = match self.id {
            Some(_) => self.table.get_new_id(),
            None => {
                let (id, sub) = self.table.get_two_new_ids();
                self.id = Some(id);
                sub
            }
        };
        self.sub_ids.push(sub);
        sub
    }

    /// Ids whose changes this transaction sees as its own.
    pub fn own_ids(&self) -> SmallVec<[Mvccid; 4]> {
        let mut ids = SmallVec::new();
        ids.extend(self.id);
        ids.extend(self.sub_ids.iter().copied());
        ids
    }

    /// Current snapshot, if one was built.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// Shorthand for [`MvccTable::build_snapshot`].
    pub fn build_snapshot(&mut self) -> &Snapshot {
        let table = Arc::clone(&self.table);
        table.build_snapshot(self)
    }

    /// Commits and frees the slot.
    pub fn commit(mut self) {
        let table = Arc::clone(&self.table);
        table.complete(&mut self, true);
    }

    /// Rolls back and frees the slot.
    pub fn rollback(mut self) {
        let table = Arc::clone(&self.table);
        table.complete(&mut self, false);
    }
}

impl Drop for MvccTx {
    fn drop(&mut self) {
        self.table.release_slot(self.slot);
    }
}

impl std::fmt::Debug for MvccTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MvccTx")
            .field("slot", &self.slot)
            .field("id", &self.id)
            .field("sub_ids", &self.sub_ids)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> Arc<MvccTable> {
        MvccTable::new(MvccOptions::default().max_transactions(8))
    }

    #[test]
    fn ids_are_sequential() {
        let table = table();
        assert_eq!(table.get_new_id(), Mvccid(1));
        assert_eq!(table.get_two_new_ids(), (Mvccid(2), Mvccid(3)));
        assert_eq!(table.peek_next_id(), Mvccid(4));
    }

    #[test]
    fn snapshot_floor_holds_back_threshold() {
        let table = table();
        let mut reader = table.begin().unwrap();
        reader.build_snapshot();
        let mut writer = table.begin().unwrap();
        let id = writer.assign_id();
        writer.commit();
        assert!(!table.is_active(id));
        assert_eq!(table.compute_global_oldest_visible(), Mvccid(1));
        drop(reader);
        assert_eq!(table.compute_global_oldest_visible(), Mvccid(2));
    }

    #[test]
    fn snapshot_sees_concurrent_writer_as_active() {
        let table = table();
        let mut writer = table.begin().unwrap();
        let id = writer.assign_id();
        let mut reader = table.begin().unwrap();
        let snap = reader.build_snapshot().clone();
        assert!(snap.is_active(id));
        writer.commit();
        assert!(snap.is_active(id));
        assert!(!reader.build_snapshot().is_active(id));
    }

    #[test]
    fn rollback_clears_floor() {
        let table = table();
        let mut tx = table.begin().unwrap();
        tx.build_snapshot();
        let id = tx.assign_id();
        tx.rollback();
        assert!(!table.is_active(id));
        assert_eq!(table.update_global_oldest_visible(), Mvccid(2));
    }

    #[test]
    fn sub_transactions_complete_independently() {
        let table = table();
        let mut tx = table.begin().unwrap();
        let sub = tx.begin_sub();
        let parent = tx.id().unwrap();
        assert_eq!(sub, parent.next());
        table.complete_sub(&mut tx, sub, true);
        assert!(!table.is_active(sub));
        assert!(table.is_active(parent));
        assert_eq!(tx.own_ids().as_slice(), &[parent, sub]);
    }

    #[test]
    fn completing_parent_completes_open_subs() {
        let table = table();
        let mut tx = table.begin().unwrap();
        let first = tx.begin_sub();
        let second = tx.begin_sub();
        let parent = tx.id().unwrap();
        table.complete_sub(&mut tx, first, true);
        tx.commit();
        for id in [parent, first, second] {
            assert!(!table.is_active(id));
        }
        assert_eq!(table.update_global_oldest_visible(), second.next());

        let mut tx = table.begin().unwrap();
        let sub = tx.begin_sub();
        tx.rollback();
        assert!(!table.is_active(sub));
        assert_eq!(table.update_global_oldest_visible(), sub.next());
    }

    #[test]
    fn slots_run_out_and_come_back() {
        let table = MvccTable::new(MvccOptions::default().max_transactions(1));
        let tx = table.begin().unwrap();
        assert!(matches!(table.begin(), Err(ReclaimError::OutOfSpace(_))));
        drop(tx);
        assert!(table.begin().is_ok());
    }

    #[test]
    fn reset_restarts_tracking() {
        let table = table();
        for _ in 0..10 {
            table.get_new_id();
        }
        table.reset(Mvccid(1000));
        assert_eq!(table.peek_next_id(), Mvccid(1000));
        assert_eq!(table.update_global_oldest_visible(), Mvccid(1000));
    }
}
