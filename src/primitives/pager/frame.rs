use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::types::PageId;

/// Resident page image plus its dirty flag.
pub(crate) struct Frame {
    pub id: PageId,
    pub buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
}

impl Frame {
    pub fn new(id: PageId, image: Box<[u8]>) -> Self {
        Self {
            id,
            buf: Arc::new(RwLock::new(image)),
            dirty: AtomicBool::new(false),
        }
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    /// Clears the flag, reporting whether it was set. Callers copy the image
    /// after this so a concurrent writer re-dirties the frame.
    pub fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Copies the current image under the shared latch.
    pub fn snapshot(&self) -> Vec<u8> {
        self.buf.read().to_vec()
    }
}
