use std::path::Path;

use serde::Serialize;

use crate::admin::{AdminError, Result};
use crate::primitives::pager::{FilePageStore, PageStore, PageStoreOptions};
use crate::types::{BlockId, FileId, Mvccid, PageId};
use crate::vacuum::data::{read_pages, DataPageDump};
use crate::vacuum::dropped::read_entries;

/// One dropped file with the page holding it.
#[derive(Clone, Debug, Serialize)]
pub struct DroppedFileRow {
    /// Page of the dropped files chain.
    pub page: PageId,
    /// Dropped file.
    pub file: FileId,
    /// Id the file was dropped at.
    pub mvccid: Mvccid,
}

/// Contents of the vacuum stores as found on disk.
#[derive(Clone, Debug, Serialize)]
pub struct InspectReport {
    /// Page size the stores were read with.
    pub page_size: u32,
    /// Pages in use in the vacuum data store.
    pub data_used_pages: u64,
    /// Live entries across the chain.
    pub live_entries: usize,
    /// Oldest live block.
    pub first_blockid: Option<BlockId>,
    /// Newest block appended, live or not.
    pub last_blockid: Option<BlockId>,
    /// The chain, page by page.
    pub data_pages: Vec<DataPageDump>,
    /// Dropped files, when a dropped files store was given.
    pub dropped: Option<Vec<DroppedFileRow>>,
}

/// Reads the vacuum data store at `data` and, optionally, the dropped files
/// store at `dropped`, without modifying either.
pub fn inspect(data: &Path, dropped: Option<&Path>, page_size: u32) -> Result<InspectReport> {
    let opts = PageStoreOptions::default().page_size(page_size);
    let store = open_store(data, opts.clone())?;
    let data_pages = read_pages(&store)?;
    let live_entries = data_pages.iter().map(|p| p.entries.len()).sum();
    let first_blockid = data_pages
        .iter()
        .find_map(|p| p.entries.first().map(|e| e.blockid));
    let last_blockid = data_pages.last().and_then(|p| p.last_blockid);

    let dropped = match dropped {
        Some(path) => {
            let store = open_store(path, opts)?;
            Some(
                read_entries(&store)?
                    .into_iter()
                    .map(|(page, entry)| DroppedFileRow {
                        page,
                        file: entry.file,
                        mvccid: entry.mvccid,
                    })
                    .collect(),
            )
        }
        None => None,
    };

    Ok(InspectReport {
        page_size,
        data_used_pages: store.used_pages(),
        live_entries,
        first_blockid,
        last_blockid,
        data_pages,
        dropped,
    })
}

fn open_store(path: &Path, opts: PageStoreOptions) -> Result<FilePageStore> {
    if !path.exists() {
        return Err(AdminError::missing_file(path));
    }
    Ok(FilePageStore::open_read_only(path, opts)?)
}
