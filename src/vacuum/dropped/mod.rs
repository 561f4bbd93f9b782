//! Files dropped while vacuum may still hold log records pointing into them.
//!
//! Each dropped file is remembered with the next transaction id at the time
//! of the drop. A record of that file with an older id belongs to the
//! dropped generation and is skipped by workers. Records with newer ids
//! belong to a new file that reused the identifier.
//!
//! Dropping waits until every busy worker has observed the drop, so the
//! caller may destroy the file as soon as [`DroppedFileTracker::add_drop`]
//! returns.

pub mod page;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, info};

use self::page::DroppedFileEntry;
use super::redo::{log_and_apply, log_free_page, RedoFile, VacuumRedo};
use crate::log::LogSource;
use crate::primitives::pager::{read_first_page, PageStore, PinnedPage, META_PAGE};
use crate::types::{page::PageKind, FileId, Mvccid, PageId, ReclaimError, Result};

/// Slot value of a worker that is not running a job.
const IDLE: u64 = u64::MAX;

/// Reads every entry of a dropped files store without modifying it.
pub fn read_entries(store: &dyn PageStore) -> Result<Vec<(PageId, DroppedFileEntry)>> {
    let mut out = Vec::new();
    let mut next = read_first_page(&store.read(META_PAGE)?)?;
    let mut hops = 0u64;
    while next.is_valid() {
        let buf = store.read(next)?;
        out.extend(page::entries(&buf)?.into_iter().map(|e| (next, e)));
        hops += 1;
        if hops > store.used_pages() {
            return Err(ReclaimError::Corruption("dropped files chain has a cycle"));
        }
        next = page::next(&buf)?;
    }
    Ok(out)
}

/// Durable set of dropped files plus the worker handshake.
pub struct DroppedFileTracker {
    store: Arc<dyn PageStore>,
    log: Arc<dyn LogSource>,
    first: RwLock<PageId>,
    drop_lock: Mutex<()>,
    version: AtomicU64,
    observed: Box<[CachePadded<AtomicU64>]>,
    wait_lock: Mutex<()>,
    wakeup: Condvar,
    spins: u32,
}

impl DroppedFileTracker {
    /// Loads the tracker kept in `store`, creating it when the store is new.
    /// `workers` is the number of worker slots taking part in the handshake.
    pub fn open(
        store: Arc<dyn PageStore>,
        log: Arc<dyn LogSource>,
        workers: usize,
        spins: u32,
    ) -> Result<Self> {
        let mut first = read_first_page(&store.read(META_PAGE)?)?;
        if !first.is_valid() {
            let page = new_page(store.as_ref(), log.as_ref())?;
            log_and_apply(
                log.as_ref(),
                &mut store.write(META_PAGE)?,
                &VacuumRedo::SetFirstPage {
                    file: RedoFile::Dropped,
                    first: page.id(),
                },
            )?;
            first = page.id();
            info!(first = first.0, "vacuum.dropped.created");
        }
        Ok(Self {
            store,
            log,
            first: RwLock::new(first),
            drop_lock: Mutex::new(()),
            version: AtomicU64::new(0),
            observed: (0..workers.max(1))
                .map(|_| CachePadded::new(AtomicU64::new(IDLE)))
                .collect(),
            wait_lock: Mutex::new(()),
            wakeup: Condvar::new(),
            spins,
        })
    }

    /// Number of worker slots.
    pub fn worker_slots(&self) -> usize {
        self.observed.len()
    }

    /// Current drop version.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Records that `file` was dropped when `mvccid` was the next id to be
    /// handed out, then waits until no worker can still act on a belief
    /// formed before the drop. One drop runs at a time.
    pub fn add_drop(&self, file: FileId, mvccid: Mvccid) -> Result<()> {
        let _serial = self.drop_lock.lock();
        {
            let first = self.first.write();
            self.insert_locked(*first, DroppedFileEntry { file, mvccid })?;
        }
        let target = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.wait_for_workers(target);
        info!(file = file.0, mvccid = mvccid.0, version = target, "vacuum.dropped.add");
        Ok(())
    }

    fn insert_locked(&self, first: PageId, entry: DroppedFileEntry) -> Result<()> {
        let cap = page::capacity(self.store.page_size());
        let mut with_room: Option<PinnedPage> = None;
        let mut last = self.store.pin(first)?;
        let mut current = Some(last.clone());
        while let Some(pinned) = current {
            let (found, count, next) = {
                let buf = pinned.read();
                (
                    page::lookup(&buf, entry.file)?,
                    page::count(&buf)?,
                    page::next(&buf)?,
                )
            };
            if found.is_some() {
                return self.apply(
                    &pinned,
                    &VacuumRedo::DroppedReplace {
                        page: pinned.id(),
                        entry,
                    },
                );
            }
            if with_room.is_none() && count < cap {
                with_room = Some(pinned.clone());
            }
            last = pinned;
            current = if next.is_valid() {
                Some(self.store.pin(next)?)
            } else {
                None
            };
        }
        let target = match with_room {
            Some(page) => page,
            None => {
                let page = new_page(self.store.as_ref(), self.log.as_ref())?;
                self.apply(
                    &last,
                    &VacuumRedo::SetDroppedLink {
                        page: last.id(),
                        next: page.id(),
                    },
                )?;
                page
            }
        };
        self.apply(
            &target,
            &VacuumRedo::DroppedInsert {
                page: target.id(),
                entry,
            },
        )
    }

    fn apply(&self, page: &PinnedPage, redo: &VacuumRedo) -> Result<()> {
        log_and_apply(self.log.as_ref(), &mut page.write(), redo).map(|_| ())
    }

    fn all_observed(&self, target: u64) -> bool {
        self.observed
            .iter()
            .all(|slot| slot.load(Ordering::SeqCst) >= target)
    }

    fn wait_for_workers(&self, target: u64) {
        let backoff = Backoff::new();
        for _ in 0..self.spins {
            if self.all_observed(target) {
                return;
            }
            backoff.snooze();
        }
        let mut guard = self.wait_lock.lock();
        while !self.all_observed(target) {
            debug!(target, "vacuum.dropped.wait_workers");
            self.wakeup.wait(&mut guard);
        }
    }

    fn notify_waiters(&self) {
        let _guard = self.wait_lock.lock();
        self.wakeup.notify_all();
    }

    /// True when a record of `file` acted on by `mvccid` belongs to a
    /// dropped generation of the file.
    pub fn is_dropped(&self, file: FileId, mvccid: Mvccid) -> Result<bool> {
        let first = self.first.read();
        let mut next = *first;
        while next.is_valid() {
            let buf = self.store.read(next)?;
            if let Some(dropped_at) = page::lookup(&buf, file)? {
                return Ok(mvccid < dropped_at);
            }
            next = page::next(&buf)?;
        }
        Ok(false)
    }

    /// Forgets files dropped before `oldest_unvacuumed` and frees trailing
    /// pages left empty. Returns how many entries were removed.
    pub fn cleanup(&self, oldest_unvacuumed: Mvccid) -> Result<usize> {
        let first = self.first.write();
        let mut pages = Vec::new();
        let mut next = *first;
        while next.is_valid() {
            let pinned = self.store.pin(next)?;
            next = page::next(&pinned.read())?;
            pages.push(pinned);
        }
        let mut removed = 0usize;
        for pinned in &pages {
            let stale = page::entries(&pinned.read())?
                .iter()
                .filter(|e| e.mvccid < oldest_unvacuumed)
                .count();
            if stale > 0 {
                self.apply(
                    pinned,
                    &VacuumRedo::DroppedRemove {
                        page: pinned.id(),
                        before: oldest_unvacuumed,
                    },
                )?;
                removed += stale;
            }
        }
        while pages.len() > 1 {
            let tail_empty = match pages.last() {
                Some(tail) => page::count(&tail.read())? == 0,
                None => false,
            };
            if !tail_empty {
                break;
            }
            let Some(tail) = pages.pop() else { break };
            let Some(prev) = pages.last() else { break };
            self.apply(
                prev,
                &VacuumRedo::SetDroppedLink {
                    page: prev.id(),
                    next: PageId::NULL,
                },
            )?;
            let id = tail.id();
            drop(tail);
            log_free_page(self.log.as_ref(), self.store.as_ref(), RedoFile::Dropped, id)?;
            debug!(page = id.0, "vacuum.dropped.page_freed");
        }
        if removed > 0 {
            debug!(removed, before = oldest_unvacuumed.0, "vacuum.dropped.cleanup");
        }
        Ok(removed)
    }

    /// Every entry, in chain order.
    pub fn entries(&self) -> Result<Vec<DroppedFileEntry>> {
        let _first = self.first.read();
        Ok(read_entries(self.store.as_ref())?
            .into_iter()
            .map(|(_, e)| e)
            .collect())
    }

    /// Writes dirty tracker pages to durable storage.
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Marks worker `slot` busy at the current version until the guard drops.
    pub fn register_worker(&self, slot: usize) -> Result<WorkerVersionGuard<'_>> {
        let cell = self
            .observed
            .get(slot)
            .ok_or(ReclaimError::Invalid("worker slot out of range"))?;
        cell.store(self.version(), Ordering::SeqCst);
        Ok(WorkerVersionGuard {
            tracker: self,
            slot,
        })
    }
}

/// A worker's observed drop version, reset to idle on drop.
pub struct WorkerVersionGuard<'a> {
    tracker: &'a DroppedFileTracker,
    slot: usize,
}

impl WorkerVersionGuard<'_> {
    /// Catches up with drops finished since the last refresh. Called before
    /// each decision that depends on a file still existing.
    pub fn refresh(&self) {
        let current = self.tracker.version();
        let cell = &self.tracker.observed[self.slot];
        if cell.swap(current, Ordering::SeqCst) != current {
            self.tracker.notify_waiters();
        }
    }
}

impl Drop for WorkerVersionGuard<'_> {
    fn drop(&mut self) {
        self.tracker.observed[self.slot].store(IDLE, Ordering::SeqCst);
        self.tracker.notify_waiters();
    }
}

fn new_page(store: &dyn PageStore, log: &dyn LogSource) -> Result<PinnedPage> {
    let page = store.allocate_page(PageKind::DroppedFiles)?;
    log_and_apply(
        log,
        &mut page.write(),
        &VacuumRedo::InitDroppedPage { page: page.id() },
    )?;
    Ok(page)
}
