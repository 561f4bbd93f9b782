use crate::types::Mvccid;

use super::bitmap::ActiveTxBitmap;

/// Point-in-time view of which transactions a reader must treat as active.
#[derive(Clone, Debug)]
pub struct Snapshot {
    /// Every id older than this had completed when the snapshot was built.
    pub lowest_active: Mvccid,
    /// Newest id known completed when the snapshot was built.
    pub highest_completed: Mvccid,
    pub(crate) bitmap: ActiveTxBitmap,
}

impl Snapshot {
    pub(crate) fn empty(high_water_units: usize) -> Self {
        Self {
            lowest_active: Mvccid::NULL,
            highest_completed: Mvccid::NULL,
            bitmap: ActiveTxBitmap::new(Mvccid::NULL, high_water_units),
        }
    }

    /// Exclusive upper bound: ids at or past it started after the snapshot.
    pub fn upper_bound(&self) -> Mvccid {
        self.highest_completed.next()
    }

    /// True when `id` was active, or not yet started, for this snapshot.
    pub fn is_active(&self, id: Mvccid) -> bool {
        if id < self.lowest_active {
            return false;
        }
        if id >= self.upper_bound() {
            return true;
        }
        self.bitmap.is_active(id)
    }

    /// Bitmap copied from the history.
    pub fn bitmap(&self) -> &ActiveTxBitmap {
        &self.bitmap
    }
}
