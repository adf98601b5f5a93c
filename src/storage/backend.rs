//! Storage backends.
//!
//! - [`MemBackend`]: concurrent hashmaps (DashMap); lost on process exit
//! - [`RedbBackend`]: ACID tables in a single redb file
//!
//! Both implement the same two-phase write: [`StorageBackend::journal`]
//! records a batch of operations, [`StorageBackend::commit`] applies it to
//! the records table and drops the batch from the journal in one step.
//! Anything still journaled at startup was never committed.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use crate::error::{StorageError, StorageResult};

/// One queued mutation of a backend key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackendOp {
    Put { key: String, bytes: Vec<u8> },
    Delete { key: String },
}

impl BackendOp {
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } => key,
        }
    }
}

/// Key/value persistence used by the storage service.
pub trait StorageBackend: Send + Sync {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// All records whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>>;

    /// Phase one: durably record a batch before applying it.
    fn journal(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()>;

    /// Phase two: apply `ops` and remove `batch` from the journal atomically.
    fn commit(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()>;

    /// Batches journaled but never committed, in batch order.
    fn journal_entries(&self) -> StorageResult<Vec<(u64, Vec<BackendOp>)>>;

    /// Move a record out of the live table.
    fn quarantine(&self, key: &str) -> StorageResult<()>;

    fn quarantined(&self) -> StorageResult<Vec<String>>;

    fn marker(&self, name: &str) -> StorageResult<Option<Vec<u8>>>;

    fn set_marker(&self, name: &str, value: &[u8]) -> StorageResult<()>;
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// In-memory backend. Clones share the same data, which lets tests simulate
/// a restart by building a second service over the same backend.
#[derive(Debug, Clone, Default)]
pub struct MemBackend {
    inner: Arc<MemInner>,
}

#[derive(Debug, Default)]
struct MemInner {
    records: DashMap<String, Vec<u8>>,
    journal: Mutex<BTreeMap<u64, Vec<BackendOp>>>,
    quarantine: DashMap<String, Vec<u8>>,
    meta: DashMap<String, Vec<u8>>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.inner.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.records.is_empty()
    }

    /// Overwrite raw bytes under a key, bypassing the journal.
    pub fn put_raw(&self, key: &str, bytes: Vec<u8>) {
        self.inner.records.insert(key.to_string(), bytes);
    }
}

impl StorageBackend for MemBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.records.get(key).map(|v| v.value().clone()))
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let mut out: Vec<(String, Vec<u8>)> = self
            .inner
            .records
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn journal(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        self.inner
            .journal
            .lock()
            .expect("journal lock poisoned")
            .insert(batch, ops.to_vec());
        Ok(())
    }

    fn commit(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        let mut journal = self.inner.journal.lock().expect("journal lock poisoned");
        for op in ops {
            match op {
                BackendOp::Put { key, bytes } => {
                    self.inner.records.insert(key.clone(), bytes.clone());
                }
                BackendOp::Delete { key } => {
                    self.inner.records.remove(key);
                }
            }
        }
        journal.remove(&batch);
        Ok(())
    }

    fn journal_entries(&self) -> StorageResult<Vec<(u64, Vec<BackendOp>)>> {
        Ok(self
            .inner
            .journal
            .lock()
            .expect("journal lock poisoned")
            .iter()
            .map(|(b, ops)| (*b, ops.clone()))
            .collect())
    }

    fn quarantine(&self, key: &str) -> StorageResult<()> {
        if let Some((k, v)) = self.inner.records.remove(key) {
            self.inner.quarantine.insert(k, v);
        }
        Ok(())
    }

    fn quarantined(&self) -> StorageResult<Vec<String>> {
        let mut keys: Vec<String> = self.inner.quarantine.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        Ok(keys)
    }

    fn marker(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.inner.meta.get(name).map(|v| v.value().clone()))
    }

    fn set_marker(&self, name: &str, value: &[u8]) -> StorageResult<()> {
        self.inner.meta.insert(name.to_string(), value.to_vec());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// redb
// ---------------------------------------------------------------------------

const RECORDS: TableDefinition<&str, &[u8]> = TableDefinition::new("records");
const JOURNAL: TableDefinition<u64, &[u8]> = TableDefinition::new("journal");
const QUARANTINE: TableDefinition<&str, &[u8]> = TableDefinition::new("quarantine");
const META: TableDefinition<&str, &[u8]> = TableDefinition::new("meta");

/// File name of the database inside the data directory.
pub const DB_FILE: &str = "multiblock.redb";

fn redb_err(what: &str, e: impl std::fmt::Display) -> StorageError {
    StorageError::Redb {
        message: format!("{what} failed: {e}"),
    }
}

/// Durable backend using redb.
pub struct RedbBackend {
    db: Arc<Database>,
}

impl RedbBackend {
    /// Open or create the database in `data_dir`.
    pub fn open(data_dir: &Path) -> StorageResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db_path = data_dir.join(DB_FILE);
        let db = Database::create(&db_path).map_err(|e| StorageError::Redb {
            message: format!("failed to open redb at {}: {e}", db_path.display()),
        })?;

        // Create every table up front so read transactions never miss one.
        let txn = db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            txn.open_table(RECORDS).map_err(|e| redb_err("open_table", e))?;
            txn.open_table(JOURNAL).map_err(|e| redb_err("open_table", e))?;
            txn.open_table(QUARANTINE).map_err(|e| redb_err("open_table", e))?;
            txn.open_table(META).map_err(|e| redb_err("open_table", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))?;

        Ok(Self { db: Arc::new(db) })
    }

    fn read_str_table(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
    ) -> StorageResult<Option<Vec<u8>>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(table).map_err(|e| redb_err("open_table", e))?;
        let result = table.get(key).map_err(|e| redb_err("get", e))?;
        Ok(result.map(|guard| guard.value().to_vec()))
    }

    fn write_str_table(
        &self,
        table: TableDefinition<&str, &[u8]>,
        key: &str,
        value: &[u8],
    ) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut table = txn.open_table(table).map_err(|e| redb_err("open_table", e))?;
            table.insert(key, value).map_err(|e| redb_err("insert", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))
    }
}

impl StorageBackend for RedbBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read_str_table(RECORDS, key)
    }

    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(RECORDS).map_err(|e| redb_err("open_table", e))?;
        let mut out = Vec::new();
        for entry in table.range(prefix..).map_err(|e| redb_err("range", e))? {
            let (k, v) = entry.map_err(|e| redb_err("range entry", e))?;
            let key = k.value();
            if !key.starts_with(prefix) {
                break;
            }
            out.push((key.to_string(), v.value().to_vec()));
        }
        Ok(out)
    }

    fn journal(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        let encoded = bincode::serialize(ops).map_err(|e| StorageError::Serialization {
            message: format!("journal encode failed: {e}"),
        })?;
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut table = txn.open_table(JOURNAL).map_err(|e| redb_err("open_table", e))?;
            table
                .insert(batch, encoded.as_slice())
                .map_err(|e| redb_err("insert", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))
    }

    fn commit(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut records = txn.open_table(RECORDS).map_err(|e| redb_err("open_table", e))?;
            for op in ops {
                match op {
                    BackendOp::Put { key, bytes } => {
                        records
                            .insert(key.as_str(), bytes.as_slice())
                            .map_err(|e| redb_err("insert", e))?;
                    }
                    BackendOp::Delete { key } => {
                        records.remove(key.as_str()).map_err(|e| redb_err("remove", e))?;
                    }
                }
            }
            let mut journal = txn.open_table(JOURNAL).map_err(|e| redb_err("open_table", e))?;
            journal.remove(batch).map_err(|e| redb_err("remove", e))?;
        }
        txn.commit().map_err(|e| redb_err("commit", e))
    }

    fn journal_entries(&self) -> StorageResult<Vec<(u64, Vec<BackendOp>)>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(JOURNAL).map_err(|e| redb_err("open_table", e))?;
        let mut out = Vec::new();
        for entry in table.iter().map_err(|e| redb_err("iter", e))? {
            let (k, v) = entry.map_err(|e| redb_err("iter entry", e))?;
            let ops: Vec<BackendOp> =
                bincode::deserialize(v.value()).map_err(|e| StorageError::Serialization {
                    message: format!("journal batch {} is unreadable: {e}", k.value()),
                })?;
            out.push((k.value(), ops));
        }
        Ok(out)
    }

    fn quarantine(&self, key: &str) -> StorageResult<()> {
        let txn = self.db.begin_write().map_err(|e| redb_err("begin_write", e))?;
        {
            let mut records = txn.open_table(RECORDS).map_err(|e| redb_err("open_table", e))?;
            let removed = records
                .remove(key)
                .map_err(|e| redb_err("remove", e))?
                .map(|guard| guard.value().to_vec());
            if let Some(bytes) = removed {
                let mut quarantine =
                    txn.open_table(QUARANTINE).map_err(|e| redb_err("open_table", e))?;
                quarantine
                    .insert(key, bytes.as_slice())
                    .map_err(|e| redb_err("insert", e))?;
            }
        }
        txn.commit().map_err(|e| redb_err("commit", e))
    }

    fn quarantined(&self) -> StorageResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(|e| redb_err("begin_read", e))?;
        let table = txn.open_table(QUARANTINE).map_err(|e| redb_err("open_table", e))?;
        let mut keys = Vec::new();
        for entry in table.iter().map_err(|e| redb_err("iter", e))? {
            let (k, _) = entry.map_err(|e| redb_err("iter entry", e))?;
            keys.push(k.value().to_string());
        }
        Ok(keys)
    }

    fn marker(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read_str_table(META, name)
    }

    fn set_marker(&self, name: &str, value: &[u8]) -> StorageResult<()> {
        self.write_str_table(META, name, value)
    }
}

impl std::fmt::Debug for RedbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBackend").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn put(key: &str, bytes: &[u8]) -> BackendOp {
        BackendOp::Put {
            key: key.into(),
            bytes: bytes.to_vec(),
        }
    }

    fn exercise(backend: &dyn StorageBackend) {
        backend.journal(1, &[put("a/b/c:1", b"one"), put("a/b/c:2", b"two")]).unwrap();
        assert_eq!(backend.journal_entries().unwrap().len(), 1);
        assert_eq!(backend.get("a/b/c:1").unwrap(), None);

        backend.commit(1, &[put("a/b/c:1", b"one"), put("a/b/c:2", b"two")]).unwrap();
        assert!(backend.journal_entries().unwrap().is_empty());
        assert_eq!(backend.get("a/b/c:1").unwrap(), Some(b"one".to_vec()));

        backend.commit(2, &[BackendOp::Delete { key: "a/b/c:2".into() }, put("a/b/d:1", b"x")]).unwrap();
        let keys: Vec<String> = backend.scan_prefix("a/b/c:").unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a/b/c:1"]);

        backend.quarantine("a/b/c:1").unwrap();
        assert_eq!(backend.get("a/b/c:1").unwrap(), None);
        assert_eq!(backend.quarantined().unwrap(), ["a/b/c:1"]);

        assert_eq!(backend.marker("session").unwrap(), None);
        backend.set_marker("session", b"running").unwrap();
        assert_eq!(backend.marker("session").unwrap(), Some(b"running".to_vec()));
    }

    #[test]
    fn mem_backend_two_phase() {
        exercise(&MemBackend::new());
    }

    #[test]
    fn redb_backend_two_phase() {
        let dir = TempDir::new().unwrap();
        exercise(&RedbBackend::open(dir.path()).unwrap());
    }

    #[test]
    fn redb_journal_survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let backend = RedbBackend::open(dir.path()).unwrap();
            backend.journal(7, &[put("x/y/z:k", b"v")]).unwrap();
        }
        let backend = RedbBackend::open(dir.path()).unwrap();
        let entries = backend.journal_entries().unwrap();
        assert_eq!(entries, vec![(7, vec![put("x/y/z:k", b"v")])]);
    }

    #[test]
    fn mem_backend_clones_share_data() {
        let a = MemBackend::new();
        let b = a.clone();
        a.commit(1, &[put("k", b"v")]).unwrap();
        assert_eq!(b.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(b.len(), 1);
    }
}
