//! In-memory WorkStore implementation.
//!
//! Design:
//! - 全テーブル（WorkSpec 行 + 依存グラフ）を 1 つの Mutex で保護
//! - トランザクションは begin から commit/drop まで lock を保持する
//! - 最初の変更の直前にテーブルを複製し、rollback 時に書き戻す
//! - `store_path` を指定すると commit ごとに JSON snapshot を書き出す
//!   （一時ファイルに書いて rename）。再起動時は snapshot から復元する

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use super::dependency::{DependencyGraph, Edge};
use crate::domain::{WorkId, WorkSpec};
use crate::error::StoreError;
use crate::ports::{StoreTransaction, WorkStore};

#[derive(Debug, Clone, Default)]
struct Tables {
    specs: BTreeMap<WorkId, WorkSpec>,
    graph: DependencyGraph,
}

/// On-disk layout of the snapshot file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    specs: Vec<WorkSpec>,
    edges: Vec<Edge>,
}

impl Tables {
    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            specs: self.specs.values().cloned().collect(),
            edges: self.graph.edges(),
        }
    }

    fn from_snapshot(snapshot: Snapshot) -> Self {
        Self {
            specs: snapshot.specs.into_iter().map(|s| (s.id, s)).collect(),
            graph: DependencyGraph::from_edges(snapshot.edges),
        }
    }
}

/// In-process WorkStore, optionally persisted to a JSON file.
pub struct InMemoryWorkStore {
    tables: Mutex<Tables>,
    snapshot_path: Option<PathBuf>,
    failing_commits: AtomicU32,
}

impl InMemoryWorkStore {
    /// Purely in-memory store.
    pub fn new() -> Self {
        Self::with_tables(Tables::default(), None)
    }

    /// Store backed by a snapshot file. Loads the file if it exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let tables = match std::fs::read(&path) {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                tracing::info!(
                    path = %path.display(),
                    rows = snapshot.specs.len(),
                    "loaded work store snapshot"
                );
                Tables::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Tables::default(),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Ok(Self::with_tables(tables, Some(path)))
    }

    fn with_tables(tables: Tables, snapshot_path: Option<PathBuf>) -> Self {
        Self {
            tables: Mutex::new(tables),
            snapshot_path,
            failing_commits: AtomicU32::new(0),
        }
    }

    /// Make the next `n` commits fail with `StoreError::Injected` (test hook).
    pub fn inject_commit_failures(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryWorkStore {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkStore for InMemoryWorkStore {
    fn begin(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        Ok(Box::new(InMemoryTransaction {
            store: self,
            tables: self.lock(),
            backup: None,
            committed: false,
        }))
    }
}

fn write_snapshot(path: &Path, tables: &Tables) -> Result<(), StoreError> {
    let io_err = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    let bytes = serde_json::to_vec_pretty(&tables.to_snapshot())?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, bytes).map_err(io_err)?;
    std::fs::rename(&tmp, path).map_err(io_err)?;
    Ok(())
}

struct InMemoryTransaction<'a> {
    store: &'a InMemoryWorkStore,
    tables: MutexGuard<'a, Tables>,
    /// Tables as they were at begin, taken on first mutation.
    backup: Option<Tables>,
    committed: bool,
}

impl InMemoryTransaction<'_> {
    fn tables_mut(&mut self) -> &mut Tables {
        if self.backup.is_none() {
            self.backup = Some(self.tables.clone());
        }
        &mut self.tables
    }
}

impl StoreTransaction for InMemoryTransaction<'_> {
    fn get(&self, id: &WorkId) -> Option<WorkSpec> {
        self.tables.specs.get(id).cloned()
    }

    fn insert(&mut self, spec: WorkSpec) -> Result<(), StoreError> {
        if self.tables.specs.contains_key(&spec.id) {
            return Err(StoreError::DuplicateId(spec.id));
        }
        self.tables_mut().specs.insert(spec.id, spec);
        Ok(())
    }

    fn update(&mut self, spec: WorkSpec) -> Result<(), StoreError> {
        if !self.tables.specs.contains_key(&spec.id) {
            return Err(StoreError::Missing(spec.id));
        }
        self.tables_mut().specs.insert(spec.id, spec);
        Ok(())
    }

    fn delete(&mut self, id: &WorkId) -> bool {
        if !self.tables.specs.contains_key(id) {
            return false;
        }
        let tables = self.tables_mut();
        tables.specs.remove(id);
        tables.graph.remove_node(id);
        true
    }

    fn all(&self) -> Vec<WorkSpec> {
        self.tables.specs.values().cloned().collect()
    }

    fn ids_for_tag(&self, tag: &str) -> Vec<WorkId> {
        self.tables
            .specs
            .values()
            .filter(|s| s.tags.contains(tag))
            .map(|s| s.id)
            .collect()
    }

    fn ids_for_name(&self, name: &str) -> Vec<WorkId> {
        self.tables
            .specs
            .values()
            .filter(|s| s.unique_name.as_deref() == Some(name))
            .map(|s| s.id)
            .collect()
    }

    fn insert_dependency(&mut self, work: WorkId, prerequisite: WorkId) {
        self.tables_mut().graph.add_dependency(work, prerequisite);
    }

    fn prerequisites(&self, id: &WorkId) -> Vec<WorkId> {
        self.tables.graph.prerequisites(id)
    }

    fn dependents(&self, id: &WorkId) -> Vec<WorkId> {
        self.tables.graph.dependents(id)
    }

    fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if self.store.take_injected_failure() {
            return Err(StoreError::Injected);
        }
        if self.backup.is_some()
            && let Some(path) = &self.store.snapshot_path
        {
            write_snapshot(path, &self.tables)?;
        }
        self.committed = true;
        Ok(())
    }
}

impl Drop for InMemoryTransaction<'_> {
    fn drop(&mut self) {
        if !self.committed
            && let Some(backup) = self.backup.take()
        {
            tracing::debug!("rolling back store transaction");
            *self.tables = backup;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::spec::tests::sample_spec;
    use crate::domain::WorkState;

    #[test]
    fn committed_changes_are_visible() {
        let store = InMemoryWorkStore::new();
        let spec = sample_spec();
        let id = spec.id;

        let mut tx = store.begin().unwrap();
        tx.insert(spec).unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(tx.get(&id).map(|s| s.state), Some(WorkState::Enqueued));
    }

    #[test]
    fn dropped_transaction_rolls_back() {
        let store = InMemoryWorkStore::new();
        let spec = sample_spec();
        let id = spec.id;

        {
            let mut tx = store.begin().unwrap();
            tx.insert(spec).unwrap();
            assert!(tx.get(&id).is_some());
        }

        assert!(store.begin().unwrap().get(&id).is_none());
    }

    #[test]
    fn injected_failure_rolls_back_and_is_consumed() {
        let store = InMemoryWorkStore::new();
        store.inject_commit_failures(1);
        let spec = sample_spec();
        let id = spec.id;

        let mut tx = store.begin().unwrap();
        tx.insert(spec.clone()).unwrap();
        assert!(matches!(tx.commit(), Err(StoreError::Injected)));
        assert!(store.begin().unwrap().get(&id).is_none());

        let mut tx = store.begin().unwrap();
        tx.insert(spec).unwrap();
        tx.commit().unwrap();
        assert!(store.begin().unwrap().get(&id).is_some());
    }

    #[test]
    fn insert_rejects_duplicate_and_update_rejects_missing() {
        let store = InMemoryWorkStore::new();
        let spec = sample_spec();

        let mut tx = store.begin().unwrap();
        tx.insert(spec.clone()).unwrap();
        assert!(matches!(
            tx.insert(spec.clone()),
            Err(StoreError::DuplicateId(_))
        ));
        assert!(matches!(
            tx.update(sample_spec()),
            Err(StoreError::Missing(_))
        ));
    }

    #[test]
    fn tag_and_name_queries() {
        let store = InMemoryWorkStore::new();
        let mut a = sample_spec();
        a.tags.insert("sync".into());
        a.unique_name = Some("daily".into());
        let b = sample_spec();

        let mut tx = store.begin().unwrap();
        tx.insert(a.clone()).unwrap();
        tx.insert(b).unwrap();
        tx.commit().unwrap();

        let tx = store.begin().unwrap();
        assert_eq!(tx.ids_for_tag("sync"), vec![a.id]);
        assert_eq!(tx.ids_for_name("daily"), vec![a.id]);
        assert!(tx.ids_for_tag("other").is_empty());
        assert_eq!(tx.all().len(), 2);
    }

    #[test]
    fn delete_drops_edges() {
        let store = InMemoryWorkStore::new();
        let a = sample_spec();
        let b = sample_spec();

        let mut tx = store.begin().unwrap();
        tx.insert(a.clone()).unwrap();
        tx.insert(b.clone()).unwrap();
        tx.insert_dependency(b.id, a.id);
        assert!(tx.delete(&a.id));
        assert!(!tx.delete(&a.id));
        assert!(tx.prerequisites(&b.id).is_empty());
        tx.commit().unwrap();
    }

    #[test]
    fn snapshot_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        let a = sample_spec();
        let b = sample_spec();

        {
            let store = InMemoryWorkStore::open(&path).unwrap();
            let mut tx = store.begin().unwrap();
            tx.insert(a.clone()).unwrap();
            tx.insert(b.clone()).unwrap();
            tx.insert_dependency(b.id, a.id);
            tx.commit().unwrap();
        }

        let store = InMemoryWorkStore::open(&path).unwrap();
        let tx = store.begin().unwrap();
        assert_eq!(tx.get(&a.id), Some(a.clone()));
        assert_eq!(tx.prerequisites(&b.id), vec![a.id]);
        assert_eq!(tx.dependents(&a.id), vec![b.id]);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("work.json");
        std::fs::write(&path, b"not json").unwrap();

        assert!(matches!(
            InMemoryWorkStore::open(&path),
            Err(StoreError::Serialization(_))
        ));
    }
}
