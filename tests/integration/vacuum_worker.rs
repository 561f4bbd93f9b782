#![allow(missing_docs)]

use std::sync::{Arc, Once};
use std::thread;
use std::time::{Duration, Instant};

use reclaim::admin::check_vacuumed;
use reclaim::log::{LogSource, MemLog, MemLogOptions, MvccOpKind, MvccOpPayload};
use reclaim::mvcc::{MvccTable, MvccTx, RecordHeader};
use reclaim::primitives::pager::MemPageStore;
use reclaim::storage::{MemHeap, MemIndex};
use reclaim::types::{FileId, Mvccid, PageId, RecordLocation, Result, SlotId};
use reclaim::vacuum::data::page::BlockStatus;
use reclaim::vacuum::metrics::CounterMetrics;
use reclaim::vacuum::{ShutdownState, Vacuum, VacuumDeps};
use reclaim::{MvccOptions, ReclaimError, VacuumOptions};
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("reclaim=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

struct Engine {
    table: Arc<MvccTable>,
    log: Arc<MemLog>,
    heap: Arc<MemHeap>,
    index: Arc<MemIndex>,
    metrics: Arc<CounterMetrics>,
    opts: VacuumOptions,
}

impl Engine {
    fn new() -> Self {
        Self::with_margin(2)
    }

    fn with_margin(pages: u64) -> Self {
        init_tracing();
        let opts = VacuumOptions::default()
            .workers(2)
            .log_pages_per_block(4)
            .log_tail_margin_pages(pages)
            .page_size(1024)
            .master_interval(Duration::from_millis(2));
        Self {
            table: MvccTable::new(MvccOptions::default()),
            log: Arc::new(
                MemLog::new(MemLogOptions::default().page_size(2048).pages_per_block(4)).unwrap(),
            ),
            heap: Arc::new(MemHeap::new()),
            index: Arc::new(MemIndex::new()),
            metrics: Arc::new(CounterMetrics::default()),
            opts,
        }
    }

    fn open(&self) -> Result<Vacuum> {
        let deps = VacuumDeps::new(
            self.table.clone(),
            self.log.clone(),
            Arc::new(MemPageStore::new(self.opts.data_store_options())?),
            Arc::new(MemPageStore::new(self.opts.dropped_store_options())?),
            self.heap.clone(),
            self.index.clone(),
        )
        .with_metrics(self.metrics.clone());
        Vacuum::open(deps, self.opts.clone())
    }

    fn insert(&self, tx: &mut MvccTx, at: RecordLocation) -> Result<()> {
        let id = tx.assign_id();
        self.heap.insert(at, RecordHeader::inserted(id));
        self.log_heap(MvccOpKind::HeapInsert, id, at)
    }

    fn delete(&self, tx: &mut MvccTx, at: RecordLocation) -> Result<()> {
        let id = tx.assign_id();
        self.heap.delete(at, id)?;
        self.log_heap(MvccOpKind::HeapDelete, id, at)
    }

    fn log_heap(&self, kind: MvccOpKind, id: Mvccid, at: RecordLocation) -> Result<()> {
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

    /// Seals the open block and moves far enough past it to be dispatched.
    fn seal(&self) -> Result<()> {
        self.log.advance_to_next_block()?;
        self.log.append_filler_pages(2)
    }
}

fn loc(file: u32, page: u64, slot: u16) -> RecordLocation {
    RecordLocation::new(FileId(file), PageId(page), SlotId(slot))
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

#[test]
fn background_vacuum_removes_dead_versions() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    vacuum.start()?;
    assert!(vacuum.is_running());

    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, loc(1, 1, 0))?;
    engine.insert(&mut tx, loc(1, 1, 1))?;
    tx.commit();
    let mut tx = engine.table.begin()?;
    engine.delete(&mut tx, loc(1, 1, 0))?;
    let deleter = tx.id().unwrap();
    tx.commit();
    engine.seal()?;

    assert!(wait_until(Duration::from_secs(5), || vacuum
        .is_mvccid_vacuumed(deleter)));
    assert_eq!(engine.heap.get(loc(1, 1, 0)), None);
    assert_eq!(engine.heap.get(loc(1, 1, 1)), Some(RecordHeader::default()));

    vacuum.stop()?;
    assert_eq!(vacuum.shutdown_state(), ShutdownState::Registered);
    assert!(!vacuum.is_running());
    check_vacuumed(engine.heap.as_ref(), engine.index.as_ref(), &vacuum).unwrap();
    let snap = engine.metrics.snapshot();
    assert_eq!(snap.blocks_vacuumed, 1);
    assert_eq!(snap.heap_removed, 1);
    Ok(())
}

#[test]
fn active_snapshot_holds_back_vacuum() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;

    let mut reader = engine.table.begin()?;
    reader.build_snapshot();
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, loc(1, 2, 0))?;
    tx.commit();
    let mut tx = engine.table.begin()?;
    engine.delete(&mut tx, loc(1, 2, 0))?;
    tx.commit();
    engine.seal()?;

    assert_eq!(vacuum.run_until_idle()?, 0);
    assert!(engine.heap.get(loc(1, 2, 0)).is_some());
    assert_eq!(vacuum.entries()?.len(), 1);

    reader.commit();
    assert_eq!(vacuum.run_until_idle()?, 1);
    assert_eq!(engine.heap.get(loc(1, 2, 0)), None);
    assert!(vacuum.entries()?.is_empty());
    Ok(())
}

#[test]
fn block_near_log_tail_waits_for_margin() -> Result<()> {
    let engine = Engine::with_margin(5);
    let vacuum = engine.open()?;
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, loc(1, 1, 0))?;
    tx.commit();
    engine.log.advance_to_next_block()?;

    // Block 0 starts on page 0 and the append position is page 4.
    assert_eq!(vacuum.run_until_idle()?, 0);
    assert_eq!(vacuum.entries()?.len(), 1);

    engine.log.append_filler_pages(1)?;
    assert_eq!(vacuum.run_until_idle()?, 1);
    assert!(vacuum.entries()?.is_empty());
    Ok(())
}

#[test]
fn dropped_generation_is_skipped() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;

    let old = loc(5, 1, 0);
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, old)?;
    tx.commit();
    let mut tx = engine.table.begin()?;
    engine.delete(&mut tx, old)?;
    tx.commit();

    vacuum.add_dropped_file(FileId(5))?;
    engine.heap.drop_file(FileId(5));
    assert!(vacuum.is_file_dropped(FileId(5), Mvccid(2))?);
    assert!(!vacuum.is_file_dropped(FileId(5), Mvccid(3))?);

    let reused = loc(5, 1, 0);
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, reused)?;
    tx.commit();
    let mut tx = engine.table.begin()?;
    engine.delete(&mut tx, reused)?;
    tx.commit();
    engine.seal()?;

    assert_eq!(vacuum.run_until_idle()?, 1);
    assert_eq!(engine.heap.get(reused), None);
    let snap = engine.metrics.snapshot();
    assert_eq!(snap.dropped_skips, 2);
    assert_eq!(snap.heap_removed, 1);
    assert!(vacuum.dropped_files()?.is_empty());
    Ok(())
}

#[test]
fn index_and_external_operations() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    let object = loc(1, 4, 0);

    let mut tx = engine.table.begin()?;
    let id = tx.assign_id();
    engine.index.insert(FileId(9), b"alpha", object, RecordHeader::inserted(id));
    engine.log.append_mvcc_op(
        MvccOpKind::IndexInsert,
        id,
        FileId(9),
        MvccOpPayload::Index {
            key: b"alpha".to_vec(),
            object,
            header: RecordHeader::inserted(id),
        },
    )?;
    engine.heap.add_external("lob/17");
    tx.commit();

    let mut tx = engine.table.begin()?;
    let id = tx.assign_id();
    engine.index.delete(FileId(9), b"alpha", object, id)?;
    engine.log.append_mvcc_op(
        MvccOpKind::IndexDelete,
        id,
        FileId(9),
        MvccOpPayload::Index {
            key: b"alpha".to_vec(),
            object,
            header: RecordHeader::inserted(Mvccid(1)).deleted_by(id),
        },
    )?;
    engine.log.append_mvcc_op(
        MvccOpKind::ExternalDelete,
        id,
        FileId(1),
        MvccOpPayload::External {
            resource: "lob/17".to_string(),
        },
    )?;
    tx.commit();
    engine.seal()?;

    assert_eq!(vacuum.run_until_idle()?, 1);
    assert_eq!(engine.index.get(FileId(9), b"alpha", object), None);
    assert!(!engine.heap.has_external("lob/17"));
    check_vacuumed(engine.heap.as_ref(), engine.index.as_ref(), &vacuum).unwrap();
    Ok(())
}

#[test]
fn interrupted_block_is_retried() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, loc(1, 1, 0))?;
    tx.commit();
    let mut tx = engine.table.begin()?;
    engine.delete(&mut tx, loc(1, 1, 0))?;
    tx.commit();
    engine.seal()?;

    vacuum.set_interrupt(true);
    assert_eq!(vacuum.run_until_idle()?, 2);
    let entries = vacuum.entries()?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, BlockStatus::Available);
    assert!(entries[0].was_interrupted);
    assert!(engine.heap.get(loc(1, 1, 0)).is_some());
    assert!(!vacuum.is_mvccid_vacuumed(Mvccid(1)));

    vacuum.set_interrupt(false);
    assert_eq!(vacuum.run_until_idle()?, 1);
    assert_eq!(engine.heap.get(loc(1, 1, 0)), None);
    assert!(vacuum.is_mvccid_vacuumed(Mvccid(2)));
    assert_eq!(engine.metrics.snapshot().blocks_interrupted, 2);
    Ok(())
}

#[test]
fn unreadable_heap_page_interrupts_without_failing() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    let mut tx = engine.table.begin()?;
    engine.insert(&mut tx, loc(1, 6, 0))?;
    tx.commit();
    engine.seal()?;

    engine.heap.set_unavailable(FileId(1), PageId(6), true);
    vacuum.run_until_idle()?;
    assert!(vacuum.entries()?[0].was_interrupted);

    engine.heap.set_unavailable(FileId(1), PageId(6), false);
    vacuum.run_until_idle()?;
    assert!(vacuum.entries()?.is_empty());
    assert_eq!(engine.heap.get(loc(1, 6, 0)), Some(RecordHeader::default()));
    Ok(())
}

#[test]
fn log_retention_follows_vacuum() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    assert_eq!(vacuum.first_log_page_to_keep()?, 0);

    for slot in 0..3 {
        let mut tx = engine.table.begin()?;
        engine.insert(&mut tx, loc(1, 1, slot))?;
        tx.commit();
        engine.log.advance_to_next_block()?;
    }
    engine.log.append_filler_pages(2)?;
    vacuum.run_until_idle()?;
    assert_eq!(
        vacuum.first_log_page_to_keep()?,
        3 * engine.log.pages_per_block()
    );

    let stats = vacuum.stats()?;
    assert_eq!(stats.live_entries, 0);
    assert_eq!(stats.last_blockid.map(|b| b.0), Some(2));
    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["shutdown"], "Running");
    Ok(())
}

#[test]
fn stopped_vacuum_cannot_restart() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    vacuum.start()?;
    vacuum.stop()?;
    vacuum.stop()?;
    assert_eq!(vacuum.shutdown_state(), ShutdownState::Registered);
    assert!(matches!(vacuum.start(), Err(ReclaimError::Shutdown)));
    Ok(())
}

#[test]
fn shutdown_without_thread_registers() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    vacuum.notify_shutdown_requested();
    assert_eq!(vacuum.shutdown_state(), ShutdownState::Requested);
    vacuum.stop()?;
    assert_eq!(vacuum.shutdown_state(), ShutdownState::Registered);
    Ok(())
}

#[test]
fn many_blocks_with_worker_pool() -> Result<()> {
    let engine = Engine::new();
    let vacuum = engine.open()?;
    vacuum.start()?;
    let mut last = Mvccid::FIRST;
    for round in 0..24u16 {
        let mut tx = engine.table.begin()?;
        engine.insert(&mut tx, loc(2, round as u64, 0))?;
        engine.insert(&mut tx, loc(2, round as u64, 1))?;
        tx.commit();
        let mut tx = engine.table.begin()?;
        engine.delete(&mut tx, loc(2, round as u64, 1))?;
        last = tx.id().unwrap();
        tx.commit();
        engine.log.advance_to_next_block()?;
    }
    engine.log.append_filler_pages(2)?;

    assert!(wait_until(Duration::from_secs(10), || vacuum
        .is_mvccid_vacuumed(last)));
    vacuum.stop()?;
    assert_eq!(engine.heap.len(FileId(2)), 24);
    check_vacuumed(engine.heap.as_ref(), engine.index.as_ref(), &vacuum).unwrap();
    assert_eq!(engine.metrics.snapshot().blocks_vacuumed, 24);
    Ok(())
}
