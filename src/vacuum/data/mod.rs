//! Durable list of log blocks that still need vacuum.
//!
//! Entries live on a singly linked chain of pages whose first page is named
//! by the store's descriptor. Blockids only grow along the chain and, within
//! a page, follow each other without holes: blocks that logged no MVCC
//! operation get a placeholder entry that is already vacuumed.
//!
//! The master owns this structure. Workers never touch its pages; they
//! report finished blocks through a queue and the master applies them with
//! [`VacuumData::mark_finished`].

pub mod page;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use self::page::{BlockStatus, DataPageHeader, VacuumDataEntry};
use super::metrics::VacuumMetrics;
use super::redo::{log_and_apply, log_free_page, EntryStatusUpdate, RedoFile, VacuumRedo};
use super::worker::{FinishedJob, JobOutcome};
use crate::log::{BlockSummary, LogSource};
use crate::primitives::concurrency::BoundedQueue;
use crate::primitives::pager::{read_first_page, PageStore, PinnedPage, META_PAGE};
use crate::types::{page::PageKind, BlockId, LogPageId, Mvccid, PageId, ReclaimError, Result};

/// Entries written by one append redo record.
const ENTRIES_PER_REDO: usize = 16;
/// Status updates carried by one redo record.
const UPDATES_PER_REDO: usize = 64;

/// One page of the chain as stored.
#[derive(Clone, Debug, Serialize)]
pub struct DataPageDump {
    /// Page id.
    pub page: PageId,
    /// First live index.
    pub first_unvacuumed: u16,
    /// One past the last live index.
    pub first_free: u16,
    /// Newest blockid appended to the page.
    pub last_blockid: Option<BlockId>,
    /// Live entries.
    pub entries: Vec<VacuumDataEntry>,
}

/// Reads the whole chain of a vacuum data store without modifying it.
pub fn read_pages(store: &dyn PageStore) -> Result<Vec<DataPageDump>> {
    let mut out = Vec::new();
    let mut next = read_first_page(&store.read(META_PAGE)?)?;
    while next.is_valid() {
        let buf = store.read(next)?;
        let hdr = page::header(&buf)?;
        out.push(DataPageDump {
            page: next,
            first_unvacuumed: hdr.first_unvacuumed,
            first_free: hdr.first_free,
            last_blockid: hdr.last_blockid,
            entries: page::live_entries(&buf)?,
        });
        if out.len() as u64 > store.used_pages() {
            return Err(ReclaimError::Corruption("vacuum data chain has a cycle"));
        }
        next = hdr.next;
    }
    Ok(out)
}

/// The vacuum data chain with its first and last pages pinned.
pub struct VacuumData {
    store: Arc<dyn PageStore>,
    log: Arc<dyn LogSource>,
    metrics: Arc<dyn VacuumMetrics>,
    first: PinnedPage,
    last: PinnedPage,
    last_blockid: Option<BlockId>,
    oldest_unvacuumed: Mvccid,
}

impl VacuumData {
    /// Loads the chain named by the descriptor of `store`, creating an
    /// empty one when the store is new.
    pub fn open(
        store: Arc<dyn PageStore>,
        log: Arc<dyn LogSource>,
        metrics: Arc<dyn VacuumMetrics>,
    ) -> Result<Self> {
        let first_id = read_first_page(&store.read(META_PAGE)?)?;
        let first = if first_id.is_valid() {
            store.pin(first_id)?
        } else {
            let page = store.allocate_page(PageKind::VacuumData)?;
            log_and_apply(
                log.as_ref(),
                &mut page.write(),
                &VacuumRedo::InitDataPage {
                    page: page.id(),
                    last_blockid: None,
                },
            )?;
            log_and_apply(
                log.as_ref(),
                &mut store.write(META_PAGE)?,
                &VacuumRedo::SetFirstPage {
                    file: RedoFile::Data,
                    first: page.id(),
                },
            )?;
            metrics.data_page_allocated();
            info!(first = page.id().0, "vacuum.data.created");
            page
        };
        let mut last = first.clone();
        let mut hops = 0u64;
        loop {
            let next = page::header(&last.read())?.next;
            if !next.is_valid() {
                break;
            }
            hops += 1;
            if hops > store.used_pages() {
                return Err(ReclaimError::Corruption("vacuum data chain has a cycle"));
            }
            last = store.pin(next)?;
        }
        let last_blockid = page::header(&last.read())?.last_blockid;
        debug!(
            first = first.id().0,
            last = last.id().0,
            last_blockid = ?last_blockid,
            "vacuum.data.open"
        );
        Ok(Self {
            store,
            log,
            metrics,
            first,
            last,
            last_blockid,
            oldest_unvacuumed: Mvccid::NULL,
        })
    }

    /// Store holding the chain.
    pub fn store(&self) -> &Arc<dyn PageStore> {
        &self.store
    }

    /// Pinned first page.
    pub fn first_page(&self) -> &PinnedPage {
        &self.first
    }

    fn pin(&self, id: PageId) -> Result<PinnedPage> {
        if id == self.first.id() {
            return Ok(self.first.clone());
        }
        if id == self.last.id() {
            return Ok(self.last.clone());
        }
        self.store.pin(id)
    }

    /// Next page after `page`, if any.
    pub(crate) fn next_page(&self, page: &PinnedPage) -> Result<Option<PinnedPage>> {
        let next = page::header(&page.read())?.next;
        if next.is_valid() {
            Ok(Some(self.pin(next)?))
        } else {
            Ok(None)
        }
    }

    fn pages(&self) -> Result<Vec<PinnedPage>> {
        let mut out = vec![self.first.clone()];
        while let Some(next) = self.next_page(&out[out.len() - 1])? {
            out.push(next);
        }
        Ok(out)
    }

    /// Drains `queue` into the chain.
    ///
    /// Duplicated or out-of-order summaries are corruption, unless
    /// `recovering`, where summaries rebuilt from the log may overlap what
    /// was already made durable and are skipped.
    pub fn consume_produced_blocks(
        &mut self,
        queue: &BoundedQueue<BlockSummary>,
        recovering: bool,
    ) -> Result<usize> {
        let mut produced = Vec::new();
        queue.drain_into(&mut produced);
        self.consume(produced, recovering)
    }

    /// Appends `summaries`, which must be in blockid order.
    pub fn consume(
        &mut self,
        summaries: impl IntoIterator<Item = BlockSummary>,
        recovering: bool,
    ) -> Result<usize> {
        let mut pending = Vec::new();
        let mut last = self.last_blockid;
        let mut consumed = 0usize;
        for summary in summaries {
            if let Some(prev) = last {
                if summary.blockid <= prev {
                    if recovering {
                        debug!(blockid = summary.blockid.0, "vacuum.data.consume.skip_known");
                        continue;
                    }
                    warn!(
                        blockid = summary.blockid.0,
                        last = prev.0,
                        "vacuum.data.consume.duplicate"
                    );
                    return Err(ReclaimError::Corruption("block summary consumed twice"));
                }
                let mut gap = prev.next();
                while gap < summary.blockid {
                    pending.push(VacuumDataEntry::gap(gap));
                    gap = gap.next();
                }
            }
            pending.push(VacuumDataEntry::available(
                summary.blockid,
                summary.start_lsa,
                summary.oldest_mvccid,
                summary.newest_mvccid,
            ));
            last = Some(summary.blockid);
            consumed += 1;
        }
        if pending.is_empty() {
            return Ok(0);
        }
        self.append_entries(&pending)?;
        self.metrics.blocks_consumed(consumed as u64);
        debug!(
            consumed,
            entries = pending.len(),
            last_blockid = ?self.last_blockid,
            "vacuum.data.consume"
        );
        Ok(consumed)
    }

    fn append_entries(&mut self, mut rest: &[VacuumDataEntry]) -> Result<()> {
        let cap = page::capacity(self.store.page_size());
        while !rest.is_empty() {
            let hdr = page::header(&self.last.read())?;
            let mut at = hdr.first_free;
            if hdr.is_empty() && at > 0 {
                self.apply(
                    &self.last,
                    &VacuumRedo::TrimData {
                        page: self.last.id(),
                        first_unvacuumed: 0,
                        first_free: 0,
                    },
                )?;
                at = 0;
            }
            let room = cap.saturating_sub(at as usize);
            if room == 0 {
                self.extend_chain()?;
                continue;
            }
            let take = room.min(rest.len()).min(ENTRIES_PER_REDO);
            let (chunk, tail) = rest.split_at(take);
            let last_blockid = chunk[take - 1].blockid;
            self.apply(
                &self.last,
                &VacuumRedo::AppendEntries {
                    page: self.last.id(),
                    at,
                    entries: chunk.to_vec(),
                    last_blockid,
                },
            )?;
            self.last_blockid = Some(last_blockid);
            rest = tail;
        }
        Ok(())
    }

    fn extend_chain(&mut self) -> Result<()> {
        let page = self.store.allocate_page(PageKind::VacuumData)?;
        self.metrics.data_page_allocated();
        self.apply(
            &page,
            &VacuumRedo::InitDataPage {
                page: page.id(),
                last_blockid: self.last_blockid,
            },
        )?;
        self.apply(
            &self.last,
            &VacuumRedo::SetDataLink {
                page: self.last.id(),
                next: page.id(),
            },
        )?;
        debug!(prev = self.last.id().0, page = page.id().0, "vacuum.data.extend");
        self.last = page;
        Ok(())
    }

    fn apply(&self, page: &PinnedPage, redo: &VacuumRedo) -> Result<()> {
        log_and_apply(self.log.as_ref(), &mut page.write(), redo).map(|_| ())
    }

    /// Logs and sets the in-progress status of the entry at `index`.
    ///
    /// The status reaches disk with the page. [`Self::reset_in_progress_after_crash`]
    /// turns whatever survived a crash back into interrupted entries.
    pub fn set_in_progress(&self, page: &PinnedPage, index: u16) -> Result<()> {
        self.apply(
            page,
            &VacuumRedo::SetEntryStatus {
                page: page.id(),
                updates: vec![EntryStatusUpdate {
                    index,
                    status: BlockStatus::InProgress,
                    was_interrupted: false,
                }],
            },
        )
    }

    /// Page and index of `blockid`, if it is still live.
    pub fn locate(&self, blockid: BlockId) -> Result<Option<(PinnedPage, u16)>> {
        let mut page = self.first.clone();
        loop {
            if let Some(idx) = page::find(&page.read(), blockid)? {
                return Ok(Some((page, idx)));
            }
            match self.next_page(&page)? {
                Some(next) => page = next,
                None => return Ok(None),
            }
        }
    }

    /// Applies finished jobs reported by workers, then trims.
    ///
    /// A vacuumed block becomes `Vacuumed`; an interrupted one goes back to
    /// `Available` with its interrupted flag set.
    pub fn mark_finished(&mut self, finished: &[FinishedJob]) -> Result<()> {
        let mut by_page: BTreeMap<PageId, (PinnedPage, Vec<EntryStatusUpdate>)> = BTreeMap::new();
        for job in finished {
            let Some((page, index)) = self.locate(job.blockid)? else {
                warn!(blockid = job.blockid.0, "vacuum.data.finished_unknown");
                continue;
            };
            let entry = page::entry(&page.read(), index as usize)?;
            if entry.status != BlockStatus::InProgress {
                warn!(
                    blockid = job.blockid.0,
                    status = ?entry.status,
                    "vacuum.data.finished_not_in_progress"
                );
                continue;
            }
            let update = match job.outcome {
                JobOutcome::Vacuumed => EntryStatusUpdate {
                    index,
                    status: BlockStatus::Vacuumed,
                    was_interrupted: false,
                },
                JobOutcome::Interrupted => EntryStatusUpdate {
                    index,
                    status: BlockStatus::Available,
                    was_interrupted: true,
                },
            };
            by_page
                .entry(page.id())
                .or_insert_with(|| (page, Vec::new()))
                .1
                .push(update);
        }
        for (id, (page, updates)) in by_page {
            for chunk in updates.chunks(UPDATES_PER_REDO) {
                self.apply(
                    &page,
                    &VacuumRedo::SetEntryStatus {
                        page: id,
                        updates: chunk.to_vec(),
                    },
                )?;
            }
        }
        self.trim()?;
        Ok(())
    }

    /// Drops leading vacuumed entries of every page and unlinks pages left
    /// empty. The last page always stays. Returns how many pages were freed.
    pub fn trim(&mut self) -> Result<usize> {
        let mut freed = 0usize;
        let mut prev: Option<PinnedPage> = None;
        let mut current = self.first.clone();
        loop {
            let hdr = page::header(&current.read())?;
            let lead = leading_vacuumed(&current, &hdr)?;
            let emptied = lead == hdr.live();
            if emptied && hdr.next.is_valid() {
                let next = self.pin(hdr.next)?;
                match &prev {
                    None => {
                        log_and_apply(
                            self.log.as_ref(),
                            &mut self.store.write(META_PAGE)?,
                            &VacuumRedo::SetFirstPage {
                                file: RedoFile::Data,
                                first: next.id(),
                            },
                        )?;
                        self.first = next.clone();
                    }
                    Some(p) => self.apply(
                        p,
                        &VacuumRedo::SetDataLink {
                            page: p.id(),
                            next: next.id(),
                        },
                    )?,
                }
                let id = current.id();
                drop(current);
                log_free_page(self.log.as_ref(), self.store.as_ref(), RedoFile::Data, id)?;
                self.metrics.data_page_freed();
                debug!(page = id.0, "vacuum.data.page_freed");
                freed += 1;
                current = next;
                continue;
            }
            if lead > 0 {
                let (first_unvacuumed, first_free) = if emptied {
                    (0, 0)
                } else {
                    (hdr.first_unvacuumed + lead as u16, hdr.first_free)
                };
                self.apply(
                    &current,
                    &VacuumRedo::TrimData {
                        page: current.id(),
                        first_unvacuumed,
                        first_free,
                    },
                )?;
            }
            match self.next_page(&current)? {
                Some(next) => {
                    prev = Some(current);
                    current = next;
                }
                None => break,
            }
        }
        Ok(freed)
    }

    /// Oldest live block.
    pub fn get_first_blockid(&self) -> Result<Option<BlockId>> {
        let mut page = self.first.clone();
        loop {
            let buf = page.read();
            let hdr = page::header(&buf)?;
            if !hdr.is_empty() {
                return Ok(Some(page::entry(&buf, hdr.first_unvacuumed as usize)?.blockid));
            }
            drop(buf);
            match self.next_page(&page)? {
                Some(next) => page = next,
                None => return Ok(None),
            }
        }
    }

    /// Newest block ever consumed.
    pub fn get_last_blockid(&self) -> Option<BlockId> {
        self.last_blockid
    }

    /// Oldest log page the log must keep for vacuum.
    pub fn first_log_page_to_keep(&self) -> Result<LogPageId> {
        let ppb = self.log.pages_per_block();
        Ok(match self.get_first_blockid()? {
            Some(first) => first.first_log_page(ppb),
            None => self
                .last_blockid
                .map_or(0, |last| last.next().first_log_page(ppb)),
        })
    }

    /// Recomputes the oldest id whose operations may still be unvacuumed.
    ///
    /// `open_block_oldest` must be read from the log before the production
    /// queue was last drained, and `oldest_visible` before that. The value
    /// never moves backwards.
    pub fn update_oldest_unvacuumed(
        &mut self,
        oldest_visible: Mvccid,
        open_block_oldest: Option<Mvccid>,
    ) -> Result<Mvccid> {
        let mut oldest = oldest_visible;
        for entry in self.entries()? {
            if !entry.is_vacuumed() {
                oldest = oldest.min(entry.oldest_mvccid);
            }
        }
        if let Some(open) = open_block_oldest {
            oldest = oldest.min(open);
        }
        if oldest > self.oldest_unvacuumed {
            self.oldest_unvacuumed = oldest;
        }
        Ok(self.oldest_unvacuumed)
    }

    /// Last value computed by [`VacuumData::update_oldest_unvacuumed`].
    pub fn oldest_unvacuumed(&self) -> Mvccid {
        self.oldest_unvacuumed
    }

    /// Turns entries left in progress by a crash into interrupted ones.
    pub fn reset_in_progress_after_crash(&mut self) -> Result<usize> {
        let mut reset = 0usize;
        for page in self.pages()? {
            let updates: Vec<EntryStatusUpdate> = {
                let buf = page.read();
                let hdr = page::header(&buf)?;
                let mut updates = Vec::new();
                for index in hdr.first_unvacuumed..hdr.first_free {
                    if page::entry(&buf, index as usize)?.status == BlockStatus::InProgress {
                        updates.push(EntryStatusUpdate {
                            index,
                            status: BlockStatus::Available,
                            was_interrupted: true,
                        });
                    }
                }
                updates
            };
            reset += updates.len();
            for chunk in updates.chunks(UPDATES_PER_REDO) {
                self.apply(
                    &page,
                    &VacuumRedo::SetEntryStatus {
                        page: page.id(),
                        updates: chunk.to_vec(),
                    },
                )?;
            }
        }
        if reset > 0 {
            info!(reset, "vacuum.data.reset_in_progress");
        }
        Ok(reset)
    }

    /// Every live entry, oldest first.
    pub fn entries(&self) -> Result<Vec<VacuumDataEntry>> {
        let mut out = Vec::new();
        for page in self.pages()? {
            out.extend(page::live_entries(&page.read())?);
        }
        Ok(out)
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.get_first_blockid()?.is_none())
    }

    /// Pages in the chain.
    pub fn page_count(&self) -> Result<usize> {
        Ok(self.pages()?.len())
    }
}

fn leading_vacuumed(page: &PinnedPage, hdr: &DataPageHeader) -> Result<usize> {
    let buf = page.read();
    let mut lead = 0;
    for index in hdr.first_unvacuumed..hdr.first_free {
        if !page::entry(&buf, index as usize)?.is_vacuumed() {
            break;
        }
        lead += 1;
    }
    Ok(lead)
}
