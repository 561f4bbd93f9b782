#![allow(missing_docs)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use reclaim::admin::verify_vacuumed;
use reclaim::log::{MemLog, MemLogOptions, MvccOpKind, MvccOpPayload};
use reclaim::mvcc::{MvccTable, RecordHeader};
use reclaim::primitives::pager::{FilePageStore, MemPageStore, PageStore};
use reclaim::storage::{MemHeap, MemIndex};
use reclaim::types::{FileId, Mvccid, PageId, RecordLocation, Result, SlotId};
use reclaim::vacuum::metrics::CounterMetrics;
use reclaim::vacuum::{Vacuum, VacuumDeps};
use reclaim::{MvccOptions, VacuumOptions};
use tempfile::tempdir;

#[derive(Clone)]
struct Fixture {
    table: Arc<MvccTable>,
    log: Arc<MemLog>,
    heap: Arc<MemHeap>,
    index: Arc<MemIndex>,
    metrics: Arc<CounterMetrics>,
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
            index: Arc::new(MemIndex::new()),
            metrics: Arc::new(CounterMetrics::default()),
            opts: VacuumOptions::default()
                .workers(3)
                .master_interval(Duration::from_millis(1)),
        })
    }

    fn open_with(&self, dropped: Arc<dyn PageStore>) -> Result<Vacuum> {
        let deps = VacuumDeps::new(
            self.table.clone(),
            self.log.clone(),
            Arc::new(MemPageStore::new(self.opts.data_store_options())?),
            dropped,
            self.heap.clone(),
            self.index.clone(),
        )
        .with_metrics(self.metrics.clone());
        Vacuum::open(deps, self.opts.clone())
    }

    fn open(&self) -> Result<Vacuum> {
        self.open_with(Arc::new(MemPageStore::new(
            self.opts.dropped_store_options(),
        )?))
    }

    /// Inserts then deletes one record of `file` and seals the block.
    fn churn(&self, file: FileId, page: u64) -> Result<Mvccid> {
        let at = RecordLocation::new(file, PageId(page), SlotId(0));
        let mut tx = self.table.begin()?;
        let id = tx.assign_id();
        self.heap.insert(at, RecordHeader::inserted(id));
        self.log_op(MvccOpKind::HeapInsert, id, at)?;
        tx.commit();

        let mut tx = self.table.begin()?;
        let id = tx.assign_id();
        self.heap.delete(at, id)?;
        self.log_op(MvccOpKind::HeapDelete, id, at)?;
        tx.commit();
        self.log.advance_to_next_block()?;
        Ok(id)
    }

    fn log_op(&self, kind: MvccOpKind, id: Mvccid, at: RecordLocation) -> Result<()> {
        self.log.append_mvcc_op(
            kind,
            id,
            at.file,
            MvccOpPayload::Heap {
                page: at.page,
                slot: at.slot,
            },
        )?;
        Ok(())
    }
}

#[test]
fn entry_is_forgotten_once_older_ids_are_vacuumed() -> Result<()> {
    let fx = Fixture::new()?;
    let vacuum = fx.open()?;
    fx.churn(FileId(4), 1)?;
    vacuum.add_dropped_file(FileId(4))?;
    fx.heap.drop_file(FileId(4));
    assert_eq!(vacuum.dropped_files()?.len(), 1);

    // The entry goes once an id after the drop has been vacuumed too.
    fx.churn(FileId(1), 2)?;
    fx.log.append_filler_pages(2)?;
    vacuum.run_until_idle()?;
    assert!(vacuum.dropped_files()?.is_empty());
    assert!(!vacuum.is_file_dropped(FileId(4), Mvccid(1))?);
    assert_eq!(fx.metrics.snapshot().dropped_skips, 2);
    Ok(())
}

#[test]
fn dropping_while_workers_run() -> Result<()> {
    let fx = Fixture::new()?;
    for page in 0..8 {
        fx.churn(FileId(6), page)?;
    }
    let vacuum = Arc::new(fx.open()?);
    vacuum.start()?;

    let writer = {
        let writer = fx.clone();
        thread::spawn(move || -> Result<Mvccid> {
            let mut last = Mvccid::FIRST;
            for page in 0..64 {
                last = writer.churn(FileId(5), page)?;
            }
            writer.log.append_filler_pages(2)?;
            Ok(last)
        })
    };

    thread::sleep(Duration::from_millis(5));
    vacuum.add_dropped_file(FileId(6))?;
    fx.heap.drop_file(FileId(6));
    let last = writer.join().unwrap()?;

    let deadline = Instant::now() + Duration::from_secs(10);
    while !vacuum.is_mvccid_vacuumed(last) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(2));
    }
    assert!(vacuum.is_mvccid_vacuumed(last));
    vacuum.stop()?;

    let report = verify_vacuumed(fx.heap.as_ref(), fx.index.as_ref(), &vacuum).unwrap();
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(fx.heap.len(FileId(5)), 0);
    Ok(())
}

#[test]
fn dropped_entries_persist_in_file_store() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("vacuum.dropped");
    let fx = Fixture::new()?;
    {
        let store = FilePageStore::create(&path, fx.opts.dropped_store_options())?;
        let vacuum = fx.open_with(Arc::new(store))?;
        vacuum.add_dropped_file(FileId(11))?;
        vacuum.add_dropped_file(FileId(12))?;
        vacuum.stop()?;
    }
    let store = FilePageStore::open(&path, fx.opts.dropped_store_options())?;
    let vacuum = fx.open_with(Arc::new(store))?;
    let mut files: Vec<FileId> = vacuum.dropped_files()?.iter().map(|e| e.file).collect();
    files.sort();
    assert_eq!(files, vec![FileId(11), FileId(12)]);
    assert!(vacuum.is_file_dropped(FileId(12), Mvccid::FIRST)?);
    Ok(())
}
