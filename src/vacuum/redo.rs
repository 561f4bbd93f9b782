//! Redo records for every change vacuum makes to its durable files.
//!
//! A change is logged before it touches the page, then applied through the
//! same code that recovery uses. Records carry absolute values and each page
//! remembers the last record applied to it, so replaying a record twice, or
//! replaying one the page already reflects, changes nothing.
//!
//! Heap overflow pages are the one target outside the vacuum files. Their
//! records are replayed through [`HeapStore`].

use tracing::trace;

use crate::log::LogSource;
use crate::primitives::bytes::{ByteReader, ByteWriter};
use crate::primitives::pager::{write_first_page, PageStore, PageWrite, META_PAGE};
use crate::storage::HeapStore;
use crate::types::{
    page::{page_kind, PageKind},
    BlockId, FileId, Lsa, Mvccid, PageId, ReclaimError, Result,
};

use super::data::page as data_page;
use super::data::page::{BlockStatus, VacuumDataEntry};
use super::dropped::page as dropped_page;
use super::dropped::page::DroppedFileEntry;

/// Durable file a redo record targets.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RedoFile {
    /// Vacuum data.
    Data = 1,
    /// Dropped files.
    Dropped = 2,
}

impl TryFrom<u8> for RedoFile {
    type Error = ReclaimError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RedoFile::Data),
            2 => Ok(RedoFile::Dropped),
            _ => Err(ReclaimError::Corruption("unknown redo file")),
        }
    }
}

/// New status of one data entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EntryStatusUpdate {
    /// Entry index on the page.
    pub index: u16,
    /// New status.
    pub status: BlockStatus,
    /// New interrupted flag.
    pub was_interrupted: bool,
}

/// One durable change to a vacuum file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VacuumRedo {
    /// Formats an empty data page.
    InitDataPage {
        /// Page to format.
        page: PageId,
        /// Blockid the page continues from.
        last_blockid: Option<BlockId>,
    },
    /// Writes entries at `at` and extends the live window to cover them.
    AppendEntries {
        /// Data page.
        page: PageId,
        /// First index written.
        at: u16,
        /// Entries, in blockid order.
        entries: Vec<VacuumDataEntry>,
        /// Newest blockid on the page afterwards.
        last_blockid: BlockId,
    },
    /// Sets the forward link of a data page.
    SetDataLink {
        /// Data page.
        page: PageId,
        /// New next page.
        next: PageId,
    },
    /// Sets the status of entries on one data page.
    SetEntryStatus {
        /// Data page.
        page: PageId,
        /// Per-entry updates.
        updates: Vec<EntryStatusUpdate>,
    },
    /// Overwrites the live window of a data page.
    TrimData {
        /// Data page.
        page: PageId,
        /// New first live index.
        first_unvacuumed: u16,
        /// New first free index.
        first_free: u16,
    },
    /// Records the first page of a file's chain in its descriptor.
    SetFirstPage {
        /// Target file.
        file: RedoFile,
        /// New first page.
        first: PageId,
    },
    /// Returns a page to its file's free list.
    FreePage {
        /// Target file.
        file: RedoFile,
        /// Page to free.
        page: PageId,
    },
    /// Formats an empty dropped files page.
    InitDroppedPage {
        /// Page to format.
        page: PageId,
    },
    /// Adds a dropped file, replacing any entry for the same file.
    DroppedInsert {
        /// Dropped files page.
        page: PageId,
        /// New entry.
        entry: DroppedFileEntry,
    },
    /// Moves the drop id of an existing entry.
    DroppedReplace {
        /// Dropped files page.
        page: PageId,
        /// Entry with the new drop id.
        entry: DroppedFileEntry,
    },
    /// Removes entries dropped before `before`.
    DroppedRemove {
        /// Dropped files page.
        page: PageId,
        /// Cleanup threshold.
        before: Mvccid,
    },
    /// Sets the forward link of a dropped files page.
    SetDroppedLink {
        /// Dropped files page.
        page: PageId,
        /// New next page.
        next: PageId,
    },
    /// Clears the inserter stored on the first overflow page of a heap
    /// record.
    RemoveOverflowInsid {
        /// Heap file.
        file: FileId,
        /// First overflow page.
        page: PageId,
    },
}

const TAG_INIT_DATA: u8 = 1;
const TAG_APPEND: u8 = 2;
const TAG_DATA_LINK: u8 = 3;
const TAG_STATUS: u8 = 4;
const TAG_TRIM: u8 = 5;
const TAG_FIRST_PAGE: u8 = 6;
const TAG_FREE_PAGE: u8 = 7;
const TAG_INIT_DROPPED: u8 = 8;
const TAG_DROPPED_INSERT: u8 = 9;
const TAG_DROPPED_REPLACE: u8 = 10;
const TAG_DROPPED_REMOVE: u8 = 11;
const TAG_DROPPED_LINK: u8 = 12;
const TAG_OVERFLOW_INSID: u8 = 13;
const NO_BLOCK: u64 = u64::MAX;

impl VacuumRedo {
    /// Vacuum file the record changes, `None` for heap changes.
    pub fn file(&self) -> Option<RedoFile> {
        match self {
            VacuumRedo::InitDataPage { .. }
            | VacuumRedo::AppendEntries { .. }
            | VacuumRedo::SetDataLink { .. }
            | VacuumRedo::SetEntryStatus { .. }
            | VacuumRedo::TrimData { .. } => Some(RedoFile::Data),
            VacuumRedo::SetFirstPage { file, .. } | VacuumRedo::FreePage { file, .. } => {
                Some(*file)
            }
            VacuumRedo::InitDroppedPage { .. }
            | VacuumRedo::DroppedInsert { .. }
            | VacuumRedo::DroppedReplace { .. }
            | VacuumRedo::DroppedRemove { .. }
            | VacuumRedo::SetDroppedLink { .. } => Some(RedoFile::Dropped),
            VacuumRedo::RemoveOverflowInsid { .. } => None,
        }
    }

    /// Page the record changes.
    pub fn page(&self) -> PageId {
        match self {
            VacuumRedo::SetFirstPage { .. } => META_PAGE,
            VacuumRedo::InitDataPage { page, .. }
            | VacuumRedo::AppendEntries { page, .. }
            | VacuumRedo::SetDataLink { page, .. }
            | VacuumRedo::SetEntryStatus { page, .. }
            | VacuumRedo::TrimData { page, .. }
            | VacuumRedo::FreePage { page, .. }
            | VacuumRedo::InitDroppedPage { page }
            | VacuumRedo::DroppedInsert { page, .. }
            | VacuumRedo::DroppedReplace { page, .. }
            | VacuumRedo::DroppedRemove { page, .. }
            | VacuumRedo::SetDroppedLink { page, .. }
            | VacuumRedo::RemoveOverflowInsid { page, .. } => *page,
        }
    }

    fn page_kind(&self, file: RedoFile) -> PageKind {
        match self {
            VacuumRedo::SetFirstPage { .. } => PageKind::Meta,
            VacuumRedo::FreePage { .. } => PageKind::Free,
            _ => match file {
                RedoFile::Data => PageKind::VacuumData,
                RedoFile::Dropped => PageKind::DroppedFiles,
            },
        }
    }

    /// Applies the change to a latched vacuum page image. `FreePage` and
    /// heap changes are not local to such a page and are rejected.
    pub(crate) fn apply_to(&self, buf: &mut [u8]) -> Result<()> {
        match self {
            VacuumRedo::InitDataPage { page, last_blockid } => {
                data_page::init(buf, *page, *last_blockid)
            }
            VacuumRedo::AppendEntries {
                at,
                entries,
                last_blockid,
                ..
            } => data_page::append(buf, *at, entries, *last_blockid),
            VacuumRedo::SetDataLink { next, .. } => data_page::set_next(buf, *next),
            VacuumRedo::SetEntryStatus { updates, .. } => {
                for update in updates {
                    data_page::set_status(buf, update.index, update.status, update.was_interrupted)?;
                }
                Ok(())
            }
            VacuumRedo::TrimData {
                first_unvacuumed,
                first_free,
                ..
            } => data_page::set_window(buf, *first_unvacuumed, *first_free),
            VacuumRedo::SetFirstPage { first, .. } => write_first_page(buf, *first),
            VacuumRedo::InitDroppedPage { page } => dropped_page::init(buf, *page),
            VacuumRedo::DroppedInsert { entry, .. } => dropped_page::insert(buf, *entry),
            VacuumRedo::DroppedReplace { entry, .. } => dropped_page::replace(buf, *entry),
            VacuumRedo::DroppedRemove { before, .. } => {
                dropped_page::remove_before(buf, *before).map(|_| ())
            }
            VacuumRedo::SetDroppedLink { next, .. } => dropped_page::set_next(buf, *next),
            VacuumRedo::FreePage { .. } => {
                Err(ReclaimError::Invalid("free page redo is not page local"))
            }
            VacuumRedo::RemoveOverflowInsid { .. } => {
                Err(ReclaimError::Invalid("heap redo is not a vacuum page change"))
            }
        }
    }

    /// Appends the record body.
    pub fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            VacuumRedo::InitDataPage { page, last_blockid } => {
                w.put_u8(TAG_INIT_DATA);
                w.put_u64(page.0);
                w.put_u64(last_blockid.map_or(NO_BLOCK, |b| b.0));
            }
            VacuumRedo::AppendEntries {
                page,
                at,
                entries,
                last_blockid,
            } => {
                w.put_u8(TAG_APPEND);
                w.put_u64(page.0);
                w.put_u16(*at);
                let count = u16::try_from(entries.len())
                    .map_err(|_| ReclaimError::Invalid("too many entries in one redo"))?;
                w.put_u16(count);
                for entry in entries {
                    entry.encode(w);
                }
                w.put_u64(last_blockid.0);
            }
            VacuumRedo::SetDataLink { page, next } => {
                w.put_u8(TAG_DATA_LINK);
                w.put_u64(page.0);
                w.put_u64(next.0);
            }
            VacuumRedo::SetEntryStatus { page, updates } => {
                w.put_u8(TAG_STATUS);
                w.put_u64(page.0);
                let count = u16::try_from(updates.len())
                    .map_err(|_| ReclaimError::Invalid("too many updates in one redo"))?;
                w.put_u16(count);
                for update in updates {
                    w.put_u16(update.index);
                    w.put_u8(update.status as u8);
                    w.put_u8(update.was_interrupted as u8);
                }
            }
            VacuumRedo::TrimData {
                page,
                first_unvacuumed,
                first_free,
            } => {
                w.put_u8(TAG_TRIM);
                w.put_u64(page.0);
                w.put_u16(*first_unvacuumed);
                w.put_u16(*first_free);
            }
            VacuumRedo::SetFirstPage { file, first } => {
                w.put_u8(TAG_FIRST_PAGE);
                w.put_u8(*file as u8);
                w.put_u64(first.0);
            }
            VacuumRedo::FreePage { file, page } => {
                w.put_u8(TAG_FREE_PAGE);
                w.put_u8(*file as u8);
                w.put_u64(page.0);
            }
            VacuumRedo::InitDroppedPage { page } => {
                w.put_u8(TAG_INIT_DROPPED);
                w.put_u64(page.0);
            }
            VacuumRedo::DroppedInsert { page, entry } => {
                w.put_u8(TAG_DROPPED_INSERT);
                w.put_u64(page.0);
                entry.encode(w);
            }
            VacuumRedo::DroppedReplace { page, entry } => {
                w.put_u8(TAG_DROPPED_REPLACE);
                w.put_u64(page.0);
                entry.encode(w);
            }
            VacuumRedo::DroppedRemove { page, before } => {
                w.put_u8(TAG_DROPPED_REMOVE);
                w.put_u64(page.0);
                w.put_u64(before.0);
            }
            VacuumRedo::SetDroppedLink { page, next } => {
                w.put_u8(TAG_DROPPED_LINK);
                w.put_u64(page.0);
                w.put_u64(next.0);
            }
            VacuumRedo::RemoveOverflowInsid { file, page } => {
                w.put_u8(TAG_OVERFLOW_INSID);
                w.put_u32(file.0);
                w.put_u64(page.0);
            }
        }
        Ok(())
    }

    /// Reads a record body written by [`VacuumRedo::encode`].
    pub fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let tag = r.u8()?;
        Ok(match tag {
            TAG_INIT_DATA => {
                let page = PageId(r.u64()?);
                let last = r.u64()?;
                VacuumRedo::InitDataPage {
                    page,
                    last_blockid: (last != NO_BLOCK).then_some(BlockId(last)),
                }
            }
            TAG_APPEND => {
                let page = PageId(r.u64()?);
                let at = r.u16()?;
                let count = r.u16()?;
                let entries = (0..count)
                    .map(|_| VacuumDataEntry::decode(r))
                    .collect::<Result<Vec<_>>>()?;
                VacuumRedo::AppendEntries {
                    page,
                    at,
                    entries,
                    last_blockid: BlockId(r.u64()?),
                }
            }
            TAG_DATA_LINK => VacuumRedo::SetDataLink {
                page: PageId(r.u64()?),
                next: PageId(r.u64()?),
            },
            TAG_STATUS => {
                let page = PageId(r.u64()?);
                let count = r.u16()?;
                let mut updates = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    updates.push(EntryStatusUpdate {
                        index: r.u16()?,
                        status: BlockStatus::try_from(r.u8()?)?,
                        was_interrupted: r.u8()? != 0,
                    });
                }
                VacuumRedo::SetEntryStatus { page, updates }
            }
            TAG_TRIM => VacuumRedo::TrimData {
                page: PageId(r.u64()?),
                first_unvacuumed: r.u16()?,
                first_free: r.u16()?,
            },
            TAG_FIRST_PAGE => VacuumRedo::SetFirstPage {
                file: RedoFile::try_from(r.u8()?)?,
                first: PageId(r.u64()?),
            },
            TAG_FREE_PAGE => VacuumRedo::FreePage {
                file: RedoFile::try_from(r.u8()?)?,
                page: PageId(r.u64()?),
            },
            TAG_INIT_DROPPED => VacuumRedo::InitDroppedPage {
                page: PageId(r.u64()?),
            },
            TAG_DROPPED_INSERT => VacuumRedo::DroppedInsert {
                page: PageId(r.u64()?),
                entry: DroppedFileEntry::decode(r)?,
            },
            TAG_DROPPED_REPLACE => VacuumRedo::DroppedReplace {
                page: PageId(r.u64()?),
                entry: DroppedFileEntry::decode(r)?,
            },
            TAG_DROPPED_REMOVE => VacuumRedo::DroppedRemove {
                page: PageId(r.u64()?),
                before: Mvccid(r.u64()?),
            },
            TAG_DROPPED_LINK => VacuumRedo::SetDroppedLink {
                page: PageId(r.u64()?),
                next: PageId(r.u64()?),
            },
            TAG_OVERFLOW_INSID => VacuumRedo::RemoveOverflowInsid {
                file: FileId(r.u32()?),
                page: PageId(r.u64()?),
            },
            _ => return Err(ReclaimError::Corruption("unknown vacuum redo tag")),
        })
    }
}

/// Logs `redo`, applies it to the latched page and stamps the page.
pub(crate) fn log_and_apply(
    log: &dyn LogSource,
    page: &mut PageWrite,
    redo: &VacuumRedo,
) -> Result<Lsa> {
    debug_assert_eq!(page.id, redo.page());
    let lsa = log.append_redo(redo)?;
    redo.apply_to(page)?;
    page.set_page_lsa(lsa)?;
    trace!(page = page.id.0, lsa = %lsa, "vacuum.redo.apply");
    Ok(lsa)
}

/// Logs and performs a page free. No latch on `page_id` may be held.
pub(crate) fn log_free_page(
    log: &dyn LogSource,
    store: &dyn PageStore,
    file: RedoFile,
    page_id: PageId,
) -> Result<()> {
    let lsa = log.append_redo(&VacuumRedo::FreePage {
        file,
        page: page_id,
    })?;
    store.free_page(page_id)?;
    store.write(page_id)?.set_page_lsa(lsa)
}

/// Stores redo records are replayed into.
pub struct RedoStores<'a> {
    /// Vacuum data store.
    pub data: &'a dyn PageStore,
    /// Dropped files store.
    pub dropped: &'a dyn PageStore,
    /// Heap receiving overflow changes. Without one they are skipped.
    pub heap: Option<&'a dyn HeapStore>,
}

impl RedoStores<'_> {
    fn store(&self, file: RedoFile) -> &dyn PageStore {
        match file {
            RedoFile::Data => self.data,
            RedoFile::Dropped => self.dropped,
        }
    }

    /// Replays one record logged at `lsa`. Returns false when the page
    /// already reflected it.
    pub fn replay(&self, redo: &VacuumRedo, lsa: Lsa) -> Result<bool> {
        let Some(file) = redo.file() else {
            return self.replay_heap(redo);
        };
        let store = self.store(file);
        let id = redo.page();
        let pinned = store.ensure_page(id, redo.page_kind(file))?;
        let mut guard = pinned.write();
        if guard.page_lsa()? >= lsa {
            let freed_later = page_kind(&guard)? == PageKind::Free;
            drop(guard);
            if freed_later {
                store.free_page(id)?;
            }
            return Ok(false);
        }
        if let VacuumRedo::FreePage { .. } = redo {
            drop(guard);
            store.free_page(id)?;
            store.write(id)?.set_page_lsa(lsa)?;
            return Ok(true);
        }
        redo.apply_to(&mut guard)?;
        guard.set_page_lsa(lsa)?;
        Ok(true)
    }

    // Heap changes carry absolute values, so applying one twice is harmless.
    fn replay_heap(&self, redo: &VacuumRedo) -> Result<bool> {
        match (redo, self.heap) {
            (VacuumRedo::RemoveOverflowInsid { file, page }, Some(heap)) => {
                heap.redo_remove_overflow_insid(*file, *page)
            }
            (VacuumRedo::RemoveOverflowInsid { .. }, None) => Ok(false),
            _ => Err(ReclaimError::Invalid("not a heap redo")),
        }
    }
}
