use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{apply_decision, DecideFn, HeapPageOutcome, HeapStore, StripHook, VacuumOutcome};
use crate::mvcc::{RecordHeader, VacuumDecision};
use crate::types::{FileId, Mvccid, PageId, RecordLocation, ReclaimError, Result, SlotId};

type HeapPage = RwLock<BTreeMap<SlotId, RecordHeader>>;

#[derive(Default)]
struct PageTable {
    pages: HashMap<(FileId, PageId), Arc<HeapPage>>,
    unavailable: HashSet<(FileId, PageId)>,
}

/// Records stored in overflow pages, keyed by their first overflow page.
#[derive(Default)]
struct OverflowTable {
    headers: HashMap<(FileId, PageId), RecordHeader>,
    homes: HashMap<RecordLocation, PageId>,
}

impl OverflowTable {
    fn remove(&mut self, home: RecordLocation) {
        if let Some(first) = self.homes.remove(&home) {
            self.headers.remove(&(home.file, first));
        }
    }
}

/// Heap kept in memory, one latch per page.
///
/// Records are reduced to their MVCC header, which is all vacuum looks at.
#[derive(Default)]
pub struct MemHeap {
    table: RwLock<PageTable>,
    overflow: Mutex<OverflowTable>,
    external: Mutex<HashSet<String>>,
    page_vacuums: AtomicU64,
}

impl MemHeap {
    /// Empty heap.
    pub fn new() -> Self {
        Self::default()
    }

    fn page(&self, file: FileId, page: PageId) -> Result<Option<Arc<HeapPage>>> {
        let table = self.table.read();
        if table.unavailable.contains(&(file, page)) {
            return Err(ReclaimError::NotFound);
        }
        Ok(table.pages.get(&(file, page)).cloned())
    }

    /// Stores a record, replacing whatever lived at `loc`.
    pub fn insert(&self, loc: RecordLocation, header: RecordHeader) {
        let page = {
            let mut table = self.table.write();
            Arc::clone(table.pages.entry((loc.file, loc.page)).or_default())
        };
        page.write().insert(loc.slot, header);
    }

    /// Stores a record whose header lives on overflow page `first`,
    /// replacing whatever lived at `home`.
    pub fn insert_overflow(&self, home: RecordLocation, first: PageId, header: RecordHeader) {
        if let Some(page) = self.table.read().pages.get(&(home.file, home.page)) {
            page.write().remove(&home.slot);
        }
        let mut overflow = self.overflow.lock();
        overflow.remove(home);
        overflow.homes.insert(home, first);
        overflow.headers.insert((home.file, first), header);
    }

    /// Sets the deleter of the record at `loc`.
    pub fn delete(&self, loc: RecordLocation, deleter: Mvccid) -> Result<()> {
        {
            let mut overflow = self.overflow.lock();
            if let Some(first) = overflow.homes.get(&loc).copied() {
                let header = overflow
                    .headers
                    .get_mut(&(loc.file, first))
                    .ok_or(ReclaimError::Corruption("overflow record lost its header"))?;
                header.del_id = Some(deleter);
                return Ok(());
            }
        }
        let page = self.page(loc.file, loc.page)?.ok_or(ReclaimError::NotFound)?;
        let mut slots = page.write();
        let header = slots.get_mut(&loc.slot).ok_or(ReclaimError::NotFound)?;
        header.del_id = Some(deleter);
        Ok(())
    }

    /// Header of the record at `loc`, read from its overflow page when it
    /// has one.
    pub fn get(&self, loc: RecordLocation) -> Option<RecordHeader> {
        {
            let overflow = self.overflow.lock();
            if let Some(first) = overflow.homes.get(&loc) {
                return overflow.headers.get(&(loc.file, *first)).copied();
            }
        }
        let table = self.table.read();
        let page = table.pages.get(&(loc.file, loc.page))?;
        let header = page.read().get(&loc.slot).copied();
        header
    }

    /// Live records in `file`.
    pub fn len(&self, file: FileId) -> usize {
        let table = self.table.read();
        table
            .pages
            .iter()
            .filter(|((f, _), _)| *f == file)
            .map(|(_, page)| page.read().len())
            .sum::<usize>()
            + self
                .overflow
                .lock()
                .homes
                .keys()
                .filter(|home| home.file == file)
                .count()
    }

    /// True when `file` holds no record.
    pub fn is_empty(&self, file: FileId) -> bool {
        self.len(file) == 0
    }

    /// Destroys every page of `file`.
    pub fn drop_file(&self, file: FileId) {
        self.table.write().pages.retain(|(f, _), _| *f != file);
        let mut overflow = self.overflow.lock();
        overflow.homes.retain(|home, _| home.file != file);
        overflow.headers.retain(|(f, _), _| *f != file);
    }

    /// Makes every access to the page fail until called again with false.
    pub fn set_unavailable(&self, file: FileId, page: PageId, unavailable: bool) {
        let mut table = self.table.write();
        if unavailable {
            table.unavailable.insert((file, page));
        } else {
            table.unavailable.remove(&(file, page));
        }
    }

    /// Registers an external resource.
    pub fn add_external(&self, resource: impl Into<String>) {
        self.external.lock().insert(resource.into());
    }

    /// True while the external resource exists.
    pub fn has_external(&self, resource: &str) -> bool {
        self.external.lock().contains(resource)
    }

    /// Number of [`HeapStore::vacuum_page`] calls served so far.
    pub fn page_vacuums(&self) -> u64 {
        self.page_vacuums.load(Ordering::Relaxed)
    }
}

impl HeapStore for MemHeap {
    fn vacuum_page(
        &self,
        file: FileId,
        page: PageId,
        slots: &[SlotId],
        decide: DecideFn<'_>,
    ) -> Result<HeapPageOutcome> {
        self.page_vacuums.fetch_add(1, Ordering::Relaxed);
        let mut outcome = HeapPageOutcome::default();
        let Some(latched) = self.page(file, page)? else {
            outcome.missing = slots.len() as u32;
            return Ok(outcome);
        };
        let mut records = latched.write();
        for slot in slots {
            let result = match records.get_mut(slot) {
                None => VacuumOutcome::Missing,
                Some(header) => {
                    let decision = decide(header);
                    apply_decision(header, decision)
                }
            };
            if result == VacuumOutcome::Removed {
                records.remove(slot);
            }
            outcome.record(result);
        }
        trace!(
            file = file.0,
            page = page.0,
            removed = outcome.removed,
            stripped = outcome.stripped,
            "heap.vacuum_page"
        );
        Ok(outcome)
    }

    fn vacuum_overflow(
        &self,
        home: RecordLocation,
        overflow: PageId,
        decide: DecideFn<'_>,
        on_strip: StripHook<'_>,
    ) -> Result<VacuumOutcome> {
        if self.table.read().unavailable.contains(&(home.file, overflow)) {
            return Err(ReclaimError::NotFound);
        }
        let mut latched = self.overflow.lock();
        if latched.homes.get(&home) != Some(&overflow) {
            return Ok(VacuumOutcome::Missing);
        }
        let Some(header) = latched.headers.get_mut(&(home.file, overflow)) else {
            return Err(ReclaimError::Corruption("overflow record lost its header"));
        };
        let outcome = match decide(header) {
            VacuumDecision::Remove => {
                latched.remove(home);
                VacuumOutcome::Removed
            }
            VacuumDecision::StripInsertionMarker => {
                header.ins_id = None;
                on_strip(home.file, overflow)?;
                VacuumOutcome::Stripped
            }
            VacuumDecision::Keep => VacuumOutcome::Kept,
        };
        trace!(
            file = home.file.0,
            overflow = overflow.0,
            ?outcome,
            "heap.vacuum_overflow"
        );
        Ok(outcome)
    }

    fn redo_remove_overflow_insid(&self, file: FileId, overflow: PageId) -> Result<bool> {
        let mut latched = self.overflow.lock();
        match latched.headers.get_mut(&(file, overflow)) {
            Some(header) if header.ins_id.is_some() => {
                header.ins_id = None;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn scan(&self) -> Result<Vec<(RecordLocation, RecordHeader)>> {
        let table = self.table.read();
        let mut out = Vec::new();
        for ((file, page), records) in &table.pages {
            for (slot, header) in records.read().iter() {
                out.push((RecordLocation::new(*file, *page, *slot), *header));
            }
        }
        {
            let overflow = self.overflow.lock();
            for (home, first) in &overflow.homes {
                if let Some(header) = overflow.headers.get(&(home.file, *first)) {
                    out.push((*home, *header));
                }
            }
        }
        out.sort_by_key(|(loc, _)| *loc);
        Ok(out)
    }

    fn remove_external(&self, resource: &str) -> Result<bool> {
        Ok(self.external.lock().remove(resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::is_record_removable;
    use crate::types::Lsa;

    fn loc(slot: u16) -> RecordLocation {
        RecordLocation::new(FileId(1), PageId(3), SlotId(slot))
    }

    #[test]
    fn one_pass_applies_every_outcome() {
        let heap = MemHeap::new();
        heap.insert(loc(0), RecordHeader::inserted(Mvccid(2)).deleted_by(Mvccid(4)));
        heap.insert(loc(1), RecordHeader::inserted(Mvccid(3)));
        heap.insert(loc(2), RecordHeader::inserted(Mvccid(50)));
        let decide = |h: &RecordHeader| is_record_removable(h, Mvccid(10));
        let slots = [SlotId(0), SlotId(1), SlotId(2), SlotId(9)];
        let outcome = heap
            .vacuum_page(FileId(1), PageId(3), &slots, &decide)
            .unwrap();
        assert_eq!(
            outcome,
            HeapPageOutcome {
                removed: 1,
                stripped: 1,
                kept: 1,
                missing: 1,
            }
        );
        assert_eq!(heap.get(loc(0)), None);
        assert_eq!(heap.get(loc(1)), Some(RecordHeader::default()));
        assert_eq!(heap.page_vacuums(), 1);

        let again = heap
            .vacuum_page(FileId(1), PageId(3), &slots, &decide)
            .unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(again.stripped, 0);
        assert_eq!(heap.len(FileId(1)), 2);
    }

    #[test]
    fn unavailable_page_fails() {
        let heap = MemHeap::new();
        heap.insert(loc(0), RecordHeader::inserted(Mvccid(2)));
        heap.set_unavailable(FileId(1), PageId(3), true);
        let keep = |_: &RecordHeader| VacuumDecision::Keep;
        assert!(heap
            .vacuum_page(FileId(1), PageId(3), &[SlotId(0)], &keep)
            .is_err());
        heap.set_unavailable(FileId(1), PageId(3), false);
        assert!(heap
            .vacuum_page(FileId(1), PageId(3), &[SlotId(0)], &keep)
            .is_ok());
    }

    #[test]
    fn overflow_records_keep_their_header_on_the_overflow_page() {
        let heap = MemHeap::new();
        let stripped = Mutex::new(Vec::new());
        let on_strip = |file: FileId, page: PageId| -> Result<()> {
            stripped.lock().push((file, page));
            Ok(())
        };
        let decide = |h: &RecordHeader| is_record_removable(h, Mvccid(10));
        heap.insert_overflow(loc(4), PageId(40), RecordHeader::inserted(Mvccid(3)));
        heap.insert_overflow(loc(5), PageId(50), RecordHeader::inserted(Mvccid(3)));
        heap.delete(loc(5), Mvccid(6)).unwrap();
        assert_eq!(heap.len(FileId(1)), 2);

        let outcome = heap
            .vacuum_overflow(loc(4), PageId(40), &decide, &on_strip)
            .unwrap();
        assert_eq!(outcome, VacuumOutcome::Stripped);
        assert_eq!(heap.get(loc(4)), Some(RecordHeader::default()));
        assert_eq!(*stripped.lock(), vec![(FileId(1), PageId(40))]);

        let outcome = heap
            .vacuum_overflow(loc(5), PageId(50), &decide, &on_strip)
            .unwrap();
        assert_eq!(outcome, VacuumOutcome::Removed);
        assert_eq!(heap.get(loc(5)), None);
        assert_eq!(
            heap.vacuum_overflow(loc(5), PageId(50), &decide, &on_strip)
                .unwrap(),
            VacuumOutcome::Missing
        );
        assert_eq!(heap.len(FileId(1)), 1);
        assert_eq!(stripped.lock().len(), 1);
    }

    #[test]
    fn overflow_redo_clears_inserter_once() {
        let heap = MemHeap::new();
        let header = RecordHeader::inserted(Mvccid(3)).with_prev_version(Lsa::new(1, 8));
        heap.insert_overflow(loc(4), PageId(40), header);
        assert!(heap.redo_remove_overflow_insid(FileId(1), PageId(40)).unwrap());
        assert!(!heap.redo_remove_overflow_insid(FileId(1), PageId(40)).unwrap());
        assert!(!heap.redo_remove_overflow_insid(FileId(1), PageId(41)).unwrap());
        let after = heap.get(loc(4)).unwrap();
        assert_eq!(after.ins_id, None);
        assert_eq!(after.prev_version, Some(Lsa::new(1, 8)));
    }

    #[test]
    fn external_resources_are_removed_once() {
        let heap = MemHeap::new();
        heap.add_external("blob-1");
        assert!(heap.remove_external("blob-1").unwrap());
        assert!(!heap.remove_external("blob-1").unwrap());
        assert!(!heap.has_external("blob-1"));
    }
}
