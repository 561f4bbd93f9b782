#![allow(missing_docs)]

use std::path::Path;
use std::sync::Arc;

use reclaim::admin::{inspect, AdminError};
use reclaim::log::{MemLog, MemLogOptions, MvccOpKind, MvccOpPayload};
use reclaim::mvcc::{MvccTable, RecordHeader};
use reclaim::primitives::pager::{FilePageStore, PageStore};
use reclaim::storage::{MemHeap, MemIndex};
use reclaim::types::{BlockId, FileId, PageId, RecordLocation, Result, SlotId};
use reclaim::vacuum::data::page::BlockStatus;
use reclaim::vacuum::{Vacuum, VacuumDeps};
use reclaim::{MvccOptions, VacuumOptions};
use tempfile::tempdir;

struct Fixture {
    table: Arc<MvccTable>,
    log: Arc<MemLog>,
    heap: Arc<MemHeap>,
    opts: VacuumOptions,
}

impl Fixture {
    fn new() -> Result<Self> {
        Ok(Self {
            table: MvccTable::new(MvccOptions::default()),
            log: Arc::new(MemLog::new(
                MemLogOptions::default().page_size(2048).pages_per_block(4),
            )?),
            heap: Arc::new(MemHeap::new()),
            opts: VacuumOptions::default().workers(1).page_size(256),
        })
    }

    fn open(&self, data: Arc<dyn PageStore>, dropped: Arc<dyn PageStore>) -> Result<Vacuum> {
        let deps = VacuumDeps::new(
            self.table.clone(),
            self.log.clone(),
            data,
            dropped,
            self.heap.clone(),
            Arc::new(MemIndex::new()),
        );
        Vacuum::open(deps, self.opts.clone())
    }

    fn create_stores(&self, dir: &Path) -> Result<(Arc<dyn PageStore>, Arc<dyn PageStore>)> {
        Ok((
            Arc::new(FilePageStore::create(
                dir.join("vacuum.data"),
                self.opts.data_store_options(),
            )?),
            Arc::new(FilePageStore::create(
                dir.join("vacuum.dropped"),
                self.opts.dropped_store_options(),
            )?),
        ))
    }

    fn reopen_stores(&self, dir: &Path) -> Result<(Arc<dyn PageStore>, Arc<dyn PageStore>)> {
        Ok((
            Arc::new(FilePageStore::open(
                dir.join("vacuum.data"),
                self.opts.data_store_options(),
            )?),
            Arc::new(FilePageStore::open(
                dir.join("vacuum.dropped"),
                self.opts.dropped_store_options(),
            )?),
        ))
    }

    fn insert_block(&self, page: u64) -> Result<()> {
        let at = RecordLocation::new(FileId(1), PageId(page), SlotId(0));
        let mut tx = self.table.begin()?;
        let id = tx.assign_id();
        self.heap.insert(at, RecordHeader::inserted(id));
        self.log.append_mvcc_op(
            MvccOpKind::HeapInsert,
            id,
            at.file,
            MvccOpPayload::Heap {
                page: at.page,
                slot: at.slot,
            },
        )?;
        tx.commit();
        self.log.advance_to_next_block()
    }
}

#[test]
fn entries_persist_across_reopen() -> Result<()> {
    let dir = tempdir()?;
    let fx = Fixture::new()?;
    let (data, dropped) = fx.create_stores(dir.path())?;
    let vacuum = fx.open(data, dropped)?;

    let mut reader = fx.table.begin()?;
    reader.build_snapshot();
    for page in 0..6 {
        fx.insert_block(page)?;
    }
    fx.log.append_filler_pages(2)?;
    vacuum.add_dropped_file(FileId(3))?;
    assert_eq!(vacuum.run_until_idle()?, 0);
    assert_eq!(vacuum.stats()?.data_pages, 2);
    vacuum.stop()?;
    drop(vacuum);

    let (data, dropped) = fx.reopen_stores(dir.path())?;
    let vacuum = fx.open(data, dropped)?;
    let entries = vacuum.entries()?;
    assert_eq!(entries.len(), 6);
    assert_eq!(entries[0].blockid, BlockId(0));
    assert_eq!(entries[5].blockid, BlockId(5));
    assert!(entries.iter().all(|e| e.status == BlockStatus::Available));
    assert_eq!(vacuum.dropped_files()?.len(), 1);

    reader.commit();
    assert_eq!(vacuum.run_until_idle()?, 6);
    assert!(vacuum.entries()?.is_empty());
    assert_eq!(vacuum.first_log_page_to_keep()?, 24);
    Ok(())
}

#[test]
fn inspect_reads_stores_without_opening_vacuum() -> Result<()> {
    let dir = tempdir()?;
    let fx = Fixture::new()?;
    let (data, dropped) = fx.create_stores(dir.path())?;
    let vacuum = fx.open(data, dropped)?;

    let mut reader = fx.table.begin()?;
    reader.build_snapshot();
    for page in 0..5 {
        fx.insert_block(page)?;
    }
    vacuum.add_dropped_file(FileId(9))?;
    vacuum.run_until_idle()?;
    vacuum.stop()?;
    drop(vacuum);

    let report = inspect(
        &dir.path().join("vacuum.data"),
        Some(dir.path().join("vacuum.dropped").as_path()),
        256,
    )
    .unwrap();
    assert_eq!(report.live_entries, 5);
    assert_eq!(report.first_blockid, Some(BlockId(0)));
    assert_eq!(report.last_blockid, Some(BlockId(4)));
    assert_eq!(report.data_pages.len(), 2);
    assert_eq!(report.data_pages[0].entries.len(), 4);
    let dropped = report.dropped.as_ref().unwrap();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].file, FileId(9));

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["live_entries"], 5);
    reader.commit();
    Ok(())
}

#[test]
fn inspect_reports_missing_file() {
    let dir = tempdir().unwrap();
    let err = inspect(&dir.path().join("absent.data"), None, 4096).unwrap_err();
    assert!(matches!(err, AdminError::MissingFile(_)));
}
