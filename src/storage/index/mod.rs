use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use super::{apply_decision, DecideFn, IndexStore, VacuumOutcome};
use crate::mvcc::RecordHeader;
use crate::types::{FileId, Mvccid, RecordLocation, ReclaimError, Result};

/// One index entry as returned by [`IndexStore::scan`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct IndexEntry {
    /// Index file.
    pub index: FileId,
    /// Key bytes.
    pub key: Vec<u8>,
    /// Heap record the entry points at.
    pub object: RecordLocation,
    /// MVCC fields of the entry.
    #[serde(skip)]
    pub header: RecordHeader,
}

type Tree = RwLock<BTreeMap<(Vec<u8>, RecordLocation), RecordHeader>>;

/// Indexes kept in memory, one latch per index.
#[derive(Default)]
pub struct MemIndex {
    trees: RwLock<HashMap<FileId, Arc<Tree>>>,
}

impl MemIndex {
    /// No indexes.
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self, index: FileId) -> Option<Arc<Tree>> {
        self.trees.read().get(&index).cloned()
    }

    /// Adds an entry inserted by the owner of `header`.
    pub fn insert(&self, index: FileId, key: &[u8], object: RecordLocation, header: RecordHeader) {
        let tree = Arc::clone(self.trees.write().entry(index).or_default());
        tree.write().insert((key.to_vec(), object), header);
    }

    /// Sets the deleter of an entry.
    pub fn delete(
        &self,
        index: FileId,
        key: &[u8],
        object: RecordLocation,
        deleter: Mvccid,
    ) -> Result<()> {
        let tree = self.tree(index).ok_or(ReclaimError::NotFound)?;
        let mut entries = tree.write();
        let header = entries
            .get_mut(&(key.to_vec(), object))
            .ok_or(ReclaimError::NotFound)?;
        header.del_id = Some(deleter);
        Ok(())
    }

    /// Header of an entry.
    pub fn get(&self, index: FileId, key: &[u8], object: RecordLocation) -> Option<RecordHeader> {
        let tree = self.tree(index)?;
        let header = tree.read().get(&(key.to_vec(), object)).copied();
        header
    }

    /// Live entries of `index`.
    pub fn len(&self, index: FileId) -> usize {
        self.tree(index).map_or(0, |tree| tree.read().len())
    }

    /// True when `index` holds no entry.
    pub fn is_empty(&self, index: FileId) -> bool {
        self.len(index) == 0
    }

    /// Destroys `index`.
    pub fn drop_index(&self, index: FileId) {
        self.trees.write().remove(&index);
    }
}

impl IndexStore for MemIndex {
    fn vacuum_entry(
        &self,
        index: FileId,
        key: &[u8],
        object: RecordLocation,
        decide: DecideFn<'_>,
    ) -> Result<VacuumOutcome> {
        let Some(tree) = self.tree(index) else {
            return Ok(VacuumOutcome::Missing);
        };
        let mut entries = tree.write();
        let id = (key.to_vec(), object);
        let outcome = match entries.get_mut(&id) {
            None => VacuumOutcome::Missing,
            Some(header) => {
                let decision = decide(header);
                apply_decision(header, decision)
            }
        };
        if outcome == VacuumOutcome::Removed {
            entries.remove(&id);
        }
        Ok(outcome)
    }

    fn scan(&self) -> Result<Vec<IndexEntry>> {
        let trees = self.trees.read();
        let mut out = Vec::new();
        for (index, tree) in trees.iter() {
            for ((key, object), header) in tree.read().iter() {
                out.push(IndexEntry {
                    index: *index,
                    key: key.clone(),
                    object: *object,
                    header: *header,
                });
            }
        }
        out.sort_by(|a, b| (a.index, &a.key, a.object).cmp(&(b.index, &b.key, b.object)));
        Ok(out)
    }
}
