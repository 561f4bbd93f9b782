use tracing::trace;

use super::data::page::{self, VacuumDataEntry};
use super::data::VacuumData;
use crate::primitives::pager::PinnedPage;
use crate::types::{BlockId, Result};

/// Position of the master's scan over vacuum data.
///
/// Holds a target blockid and, while loaded, the page holding it. Any change
/// to vacuum data may free or shift pages, so the master calls
/// [`VacuumJobCursor::readjust_after_data_change`] after each one and the
/// cursor re-finds its page on the next [`VacuumJobCursor::load`].
#[derive(Debug)]
pub struct VacuumJobCursor {
    blockid: BlockId,
    page: Option<PinnedPage>,
    index: u16,
}

impl VacuumJobCursor {
    /// Cursor targeting `blockid`, unloaded.
    pub fn new(blockid: BlockId) -> Self {
        Self {
            blockid,
            page: None,
            index: 0,
        }
    }

    /// Targeted block.
    pub fn blockid(&self) -> BlockId {
        self.blockid
    }

    /// True while a page is held.
    pub fn is_loaded(&self) -> bool {
        self.page.is_some()
    }

    /// Finds and pins the page holding the target, snapping forward past
    /// trimmed entries. Returns false when the target is past the newest
    /// entry.
    pub fn load(&mut self, data: &VacuumData) -> Result<bool> {
        if self.page.is_some() {
            return Ok(true);
        }
        let mut current = Some(data.first_page().clone());
        while let Some(pinned) = current {
            let (hdr, first, last) = {
                let buf = pinned.read();
                let hdr = page::header(&buf)?;
                if hdr.is_empty() {
                    (hdr, None, None)
                } else {
                    let first = page::entry(&buf, hdr.first_unvacuumed as usize)?.blockid;
                    let last = page::entry(&buf, hdr.first_free as usize - 1)?.blockid;
                    (hdr, Some(first), Some(last))
                }
            };
            if let (Some(first), Some(last)) = (first, last) {
                if self.blockid < first {
                    trace!(from = self.blockid.0, to = first.0, "vacuum.cursor.snap");
                    self.blockid = first;
                }
                if self.blockid <= last {
                    self.index = hdr.first_unvacuumed + (self.blockid.0 - first.0) as u16;
                    self.page = Some(pinned);
                    return Ok(true);
                }
            }
            current = data.next_page(&pinned)?;
        }
        Ok(false)
    }

    /// Releases the page.
    pub fn unload(&mut self) {
        self.page = None;
    }

    /// Entry at the cursor. The cursor must be loaded.
    pub fn entry(&self) -> Result<Option<VacuumDataEntry>> {
        match &self.page {
            Some(pinned) => Ok(Some(page::entry(&pinned.read(), self.index as usize)?)),
            None => Ok(None),
        }
    }

    /// Moves to the next block, reloading when it leaves the page.
    pub fn increment(&mut self, data: &VacuumData) -> Result<bool> {
        self.blockid = self.blockid.next();
        if let Some(pinned) = &self.page {
            let hdr = page::header(&pinned.read())?;
            if self.index + 1 < hdr.first_free {
                self.index += 1;
                return Ok(true);
            }
        }
        self.unload();
        self.load(data)
    }

    /// Forgets the page and moves the target to the oldest live block when
    /// it fell behind it.
    pub fn readjust_after_data_change(&mut self, data: &VacuumData) -> Result<()> {
        self.unload();
        if let Some(first) = data.get_first_blockid()? {
            if self.blockid < first {
                self.blockid = first;
            }
        }
        Ok(())
    }

    /// Marks the entry at the cursor as owned by a job, through a redo
    /// record like every other status change.
    pub fn set_in_progress(&self, data: &VacuumData) -> Result<()> {
        if let Some(pinned) = &self.page {
            data.set_in_progress(pinned, self.index)?;
        }
        Ok(())
    }
}
