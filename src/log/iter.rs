use std::sync::Arc;

use super::{LogPage, LogSource, MvccOpRecord};
use crate::types::{BlockId, LogPageId, Lsa, Result};

/// Walks the MVCC operations of one block, newest first.
///
/// Starts at the block's last operation and follows the previous-operation
/// links until they leave the block. The last fetched page is kept so runs
/// of operations on one page cost a single fetch. Yields at most one error,
/// after which it is exhausted.
pub struct MvccOpIter<'a> {
    log: &'a dyn LogSource,
    next: Option<Lsa>,
    first_page: LogPageId,
    cached: Option<Arc<LogPage>>,
}

impl<'a> MvccOpIter<'a> {
    /// Iterator over `blockid`, starting at `start_lsa`.
    pub fn new(log: &'a dyn LogSource, blockid: BlockId, start_lsa: Lsa) -> Self {
        let ppb = log.pages_per_block();
        let first_page = blockid.first_log_page(ppb);
        log.prefetch(first_page, ppb);
        let next = start_lsa
            .into_option()
            .filter(|lsa| lsa.page >= first_page && lsa.page <= blockid.last_log_page(ppb));
        Self {
            log,
            next,
            first_page,
            cached: None,
        }
    }

    fn page(&mut self, id: LogPageId) -> Result<Arc<LogPage>> {
        if let Some(page) = &self.cached {
            if page.id() == id {
                return Ok(Arc::clone(page));
            }
        }
        let page = self.log.fetch_page(id)?;
        self.cached = Some(Arc::clone(&page));
        Ok(page)
    }
}

impl Iterator for MvccOpIter<'_> {
    type Item = Result<(Lsa, MvccOpRecord)>;

    fn next(&mut self) -> Option<Self::Item> {
        let lsa = self.next.take()?;
        let op = match self.page(lsa.page).and_then(|page| page.mvcc_op_at(lsa.offset)) {
            Ok(op) => op,
            Err(err) => return Some(Err(err)),
        };
        self.next = op
            .prev_mvcc_op
            .filter(|prev| prev.page >= self.first_page && *prev < lsa);
        Some(Ok((lsa, op)))
    }
}
