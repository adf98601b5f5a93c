//! Store handles: reads with CRC and schema checks, queued writes, metrics.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use serde::Serialize;

use super::Shared;
use super::backend::BackendOp;
use super::codec::{Envelope, now_ms};
use super::ident::StoreAddress;
use crate::error::{StorageError, StorageResult};

/// Schema of one store: its current version and how to upgrade old payloads.
pub trait SchemaDescriptor: Send + Sync {
    fn schema_version(&self) -> u32;

    /// Transform a payload written at `from` into the `to` layout.
    fn migrate(&self, from: u32, to: u32, payload: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// A schema with no migrations; older records fail to read.
#[derive(Debug, Clone, Copy)]
pub struct FixedSchema(pub u32);

impl SchemaDescriptor for FixedSchema {
    fn schema_version(&self) -> u32 {
        self.0
    }

    fn migrate(&self, from: u32, to: u32, _payload: Vec<u8>) -> Result<Vec<u8>, String> {
        Err(format!("no migration from v{from} to v{to}"))
    }
}

/// A schema whose migrator is a closure.
pub struct FnSchema<F> {
    version: u32,
    migrator: F,
}

impl<F> FnSchema<F>
where
    F: Fn(u32, u32, Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync,
{
    pub fn new(version: u32, migrator: F) -> Self {
        Self { version, migrator }
    }
}

impl<F> SchemaDescriptor for FnSchema<F>
where
    F: Fn(u32, u32, Vec<u8>) -> Result<Vec<u8>, String> + Send + Sync,
{
    fn schema_version(&self) -> u32 {
        self.version
    }

    fn migrate(&self, from: u32, to: u32, payload: Vec<u8>) -> Result<Vec<u8>, String> {
        (self.migrator)(from, to, payload)
    }
}

/// A validated record as handed to callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub key: String,
    /// Payload in the store's current schema.
    pub payload: Vec<u8>,
    pub schema_version: u32,
    /// Version the record was written with; differs from `schema_version`
    /// when the payload was migrated on read.
    pub stored_version: u32,
    pub producer: String,
    pub timestamp_ms: u64,
    pub crc32: u32,
}

/// Optional overrides for a write.
#[derive(Debug, Clone, Default)]
pub struct WriteMeta {
    pub producer: Option<String>,
    pub timestamp_ms: Option<u64>,
}

/// Acknowledgement of a queued write or delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResult {
    pub key: String,
    /// Encoded envelope size; zero for deletes.
    pub bytes: usize,
    pub crc32: u32,
    pub schema_version: u32,
}

/// Point-in-time counters for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreMetrics {
    pub pending: usize,
    pub total_writes: u64,
    pub total_bytes: u64,
    pub last_write_ms: Option<u64>,
    /// Pending writes still accepted; zero when disabled.
    pub capacity: usize,
    pub disabled: bool,
}

/// Result of an operation completed by the background worker.
pub struct PendingOp<T> {
    rx: mpsc::Receiver<StorageResult<T>>,
}

impl<T> PendingOp<T> {
    pub(crate) fn channel() -> (mpsc::Sender<StorageResult<T>>, Self) {
        let (tx, rx) = mpsc::channel();
        (tx, Self { rx })
    }

    pub(crate) fn ready(result: StorageResult<T>) -> Self {
        let (tx, op) = Self::channel();
        let _ = tx.send(result);
        op
    }

    /// Block until the operation completes.
    pub fn wait(self) -> StorageResult<T> {
        self.rx.recv().unwrap_or_else(|_| Err(abandoned()))
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<StorageResult<T>> {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(mpsc::RecvTimeoutError::Timeout) => None,
            Err(mpsc::RecvTimeoutError::Disconnected) => Some(Err(abandoned())),
        }
    }

    /// Non-blocking poll.
    pub fn try_result(&self) -> Option<StorageResult<T>> {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(abandoned())),
        }
    }
}

fn abandoned() -> StorageError {
    StorageError::Disabled {
        address: "*".into(),
        reason: "operation abandoned before completion".into(),
    }
}

type Waiter = mpsc::Sender<StorageResult<WriteResult>>;

enum PendingWrite {
    Put { bytes: Vec<u8>, envelope: Envelope },
    Delete,
}

struct PendingEntry {
    write: PendingWrite,
    result: WriteResult,
    waiters: Vec<Waiter>,
}

/// Outcome of flushing one store.
#[derive(Debug, Default)]
pub(crate) struct StoreFlush {
    pub written: usize,
    pub deleted: usize,
    pub bytes: u64,
    pub error: Option<StorageError>,
    pub disabled: bool,
    pub dropped: usize,
}

/// Shared state behind every handle to one store.
pub(crate) struct StoreState {
    address: StoreAddress,
    schema: Arc<dyn SchemaDescriptor>,
    capacity: usize,
    pending: Mutex<BTreeMap<String, PendingEntry>>,
    /// Batch handed to the backend and not yet committed; `None` is a delete.
    /// Always locked after `pending`.
    in_flight: Mutex<BTreeMap<String, Option<Envelope>>>,
    /// Serializes flushes of this store.
    flush_lock: Mutex<()>,
    total_writes: AtomicU64,
    total_bytes: AtomicU64,
    last_write_ms: AtomicU64,
    failures: AtomicU32,
    disabled: RwLock<Option<String>>,
}

impl StoreState {
    pub(crate) fn new(address: StoreAddress, schema: Arc<dyn SchemaDescriptor>, capacity: usize) -> Self {
        Self {
            address,
            schema,
            capacity,
            pending: Mutex::new(BTreeMap::new()),
            in_flight: Mutex::new(BTreeMap::new()),
            flush_lock: Mutex::new(()),
            total_writes: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            failures: AtomicU32::new(0),
            disabled: RwLock::new(None),
        }
    }

    pub(crate) fn address(&self) -> &StoreAddress {
        &self.address
    }

    pub(crate) fn schema_version(&self) -> u32 {
        self.schema.schema_version()
    }

    pub(crate) fn disabled_reason(&self) -> Option<String> {
        self.disabled.read().expect("store lock poisoned").clone()
    }

    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }

    pub(crate) fn in_flight_len(&self) -> usize {
        self.in_flight.lock().expect("in-flight lock poisoned").len()
    }

    /// The queued or in-flight state of `key`: `Some(None)` is a delete,
    /// `None` means the backend is authoritative.
    fn staged(&self, key: &str) -> Option<Option<Envelope>> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        if let Some(entry) = pending.get(key) {
            return Some(match &entry.write {
                PendingWrite::Put { envelope, .. } => Some(envelope.clone()),
                PendingWrite::Delete => None,
            });
        }
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .get(key)
            .cloned()
    }

    /// Keys queued or in flight.
    fn staged_keys(&self) -> Vec<String> {
        let pending = self.pending.lock().expect("pending lock poisoned");
        let in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
        pending.keys().chain(in_flight.keys()).cloned().collect()
    }

    /// Disable the store and fail everything still queued. Returns the
    /// number of dropped writes.
    pub(crate) fn disable(&self, reason: &str) -> usize {
        {
            let mut disabled = self.disabled.write().expect("store lock poisoned");
            if disabled.is_none() {
                tracing::warn!(store = %self.address, reason, "storage store disabled");
                *disabled = Some(reason.to_string());
            }
        }
        self.drop_pending(reason)
    }

    /// Discard queued writes, failing their waiters.
    pub(crate) fn drop_pending(&self, reason: &str) -> usize {
        let drained = std::mem::take(&mut *self.pending.lock().expect("pending lock poisoned"));
        for entry in drained.values() {
            for waiter in &entry.waiters {
                let _ = waiter.send(Err(StorageError::Disabled {
                    address: self.address.to_string(),
                    reason: reason.to_string(),
                }));
            }
        }
        if !drained.is_empty() {
            tracing::warn!(store = %self.address, dropped = drained.len(), reason, "pending writes dropped");
        }
        drained.len()
    }

    /// Persist everything queued as one journaled batch.
    pub(crate) fn flush(&self, shared: &Shared) -> StoreFlush {
        let _guard = self.flush_lock.lock().expect("flush lock poisoned");
        let mut outcome = StoreFlush::default();
        if self.disabled_reason().is_some() {
            return outcome;
        }

        // Move the batch to in-flight under the pending lock so readers never
        // see a gap.
        let drained = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            let drained = std::mem::take(&mut *pending);
            let mut in_flight = self.in_flight.lock().expect("in-flight lock poisoned");
            *in_flight = drained
                .iter()
                .map(|(key, entry)| {
                    let envelope = match &entry.write {
                        PendingWrite::Put { envelope, .. } => Some(envelope.clone()),
                        PendingWrite::Delete => None,
                    };
                    (key.clone(), envelope)
                })
                .collect();
            drained
        };
        if drained.is_empty() {
            return outcome;
        }

        let ops: Vec<BackendOp> = drained
            .iter()
            .map(|(key, entry)| {
                let key = self.address.record_key(key);
                match &entry.write {
                    PendingWrite::Put { bytes, .. } => BackendOp::Put {
                        key,
                        bytes: bytes.clone(),
                    },
                    PendingWrite::Delete => BackendOp::Delete { key },
                }
            })
            .collect();

        let batch = shared.next_batch();
        let result = shared
            .backend
            .journal(batch, &ops)
            .and_then(|()| shared.backend.commit(batch, &ops));

        match result {
            Ok(()) => {
                self.in_flight.lock().expect("in-flight lock poisoned").clear();
                for entry in drained.values() {
                    match &entry.write {
                        PendingWrite::Put { bytes, .. } => {
                            outcome.written += 1;
                            outcome.bytes += bytes.len() as u64;
                        }
                        PendingWrite::Delete => outcome.deleted += 1,
                    }
                    for waiter in &entry.waiters {
                        let _ = waiter.send(Ok(entry.result.clone()));
                    }
                }
                self.total_writes
                    .fetch_add((outcome.written + outcome.deleted) as u64, Ordering::Relaxed);
                self.total_bytes.fetch_add(outcome.bytes, Ordering::Relaxed);
                self.last_write_ms.store(now_ms(), Ordering::Relaxed);
                self.failures.store(0, Ordering::Relaxed);
            }
            Err(e) => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(store = %self.address, batch, failures, error = %e, "store flush failed");
                outcome.error = Some(e);

                // Requeue; anything written since the drain is newer and wins.
                {
                    let mut pending = self.pending.lock().expect("pending lock poisoned");
                    for (key, entry) in drained {
                        match pending.entry(key) {
                            Entry::Vacant(v) => {
                                v.insert(entry);
                            }
                            Entry::Occupied(mut o) => o.get_mut().waiters.extend(entry.waiters),
                        }
                    }
                    self.in_flight.lock().expect("in-flight lock poisoned").clear();
                }

                if failures >= shared.config.max_consecutive_failures {
                    outcome.disabled = true;
                    outcome.dropped = self.disable(&format!("{failures} consecutive flush failures"));
                }
            }
        }
        outcome
    }
}

/// Handle to one `namespace/domain/store`. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    state: Arc<StoreState>,
    shared: Arc<Shared>,
}

impl Store {
    pub(crate) fn new(state: Arc<StoreState>, shared: Arc<Shared>) -> Self {
        Self { state, shared }
    }

    pub fn address(&self) -> &StoreAddress {
        self.state.address()
    }

    pub fn schema_version(&self) -> u32 {
        self.state.schema_version()
    }

    pub fn is_disabled(&self) -> bool {
        self.state.disabled_reason().is_some()
    }

    /// Read one record, seeing queued and in-flight writes first.
    ///
    /// A checksum mismatch is [`StorageError::Corrupted`]; a record newer
    /// than this store's schema is [`StorageError::SchemaTooNew`]. Disabled
    /// stores read as empty.
    pub fn read(&self, key: &str) -> StorageResult<Option<StoredRecord>> {
        if self.is_disabled() {
            return Ok(None);
        }
        let envelope = match self.state.staged(key) {
            Some(Some(envelope)) => envelope,
            Some(None) => return Ok(None),
            None => match self.shared.backend.get(&self.address().record_key(key))? {
                Some(bytes) => Envelope::decode(&bytes)?,
                None => return Ok(None),
            },
        };
        self.open(key, envelope).map(Some)
    }

    /// Every readable record, in key order. Corrupted or unreadable records
    /// are skipped with a warning; recovery reports them.
    pub fn read_all(&self) -> StorageResult<Vec<StoredRecord>> {
        if self.is_disabled() {
            return Ok(Vec::new());
        }
        let prefix = self.address().key_prefix();
        let mut keys: Vec<String> = self
            .shared
            .backend
            .scan_prefix(&prefix)?
            .into_iter()
            .filter_map(|(full, _)| full.strip_prefix(&prefix).map(str::to_string))
            .collect();
        keys.extend(self.state.staged_keys());
        keys.sort();
        keys.dedup();

        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            match self.read(&key) {
                Ok(Some(record)) => out.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(store = %self.address(), key = %key, error = %e, "skipping unreadable record"),
            }
        }
        Ok(out)
    }

    /// Queue a write. Durable after the next successful flush.
    pub fn write(&self, key: &str, payload: Vec<u8>, meta: WriteMeta) -> StorageResult<WriteResult> {
        self.enqueue(key, Some(payload), &meta, None)
    }

    /// Queue a write and get a handle that resolves once it is durable.
    pub fn write_async(&self, key: &str, payload: Vec<u8>, meta: WriteMeta) -> PendingOp<WriteResult> {
        let (tx, op) = PendingOp::channel();
        match self.enqueue(key, Some(payload), &meta, Some(tx)) {
            Ok(_) => op,
            Err(e) => PendingOp::ready(Err(e)),
        }
    }

    /// Queue a delete.
    pub fn delete(&self, key: &str, meta: WriteMeta) -> StorageResult<WriteResult> {
        self.enqueue(key, None, &meta, None)
    }

    /// Flush this store now.
    pub fn flush(&self) -> StorageResult<()> {
        match self.state.flush(&self.shared).error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn metrics(&self) -> StoreMetrics {
        let disabled = self.is_disabled();
        let pending = self.state.pending_len();
        let last = self.state.last_write_ms.load(Ordering::Relaxed);
        StoreMetrics {
            pending,
            total_writes: self.state.total_writes.load(Ordering::Relaxed),
            total_bytes: self.state.total_bytes.load(Ordering::Relaxed),
            last_write_ms: (last != 0).then_some(last),
            capacity: if disabled {
                0
            } else {
                self.state.capacity.saturating_sub(pending)
            },
            disabled,
        }
    }

    fn enqueue(
        &self,
        key: &str,
        payload: Option<Vec<u8>>,
        meta: &WriteMeta,
        waiter: Option<Waiter>,
    ) -> StorageResult<WriteResult> {
        if let Some(reason) = self.state.disabled_reason() {
            return Err(StorageError::Disabled {
                address: self.address().to_string(),
                reason,
            });
        }
        if !self.shared.is_running() {
            return Err(StorageError::Disabled {
                address: self.address().to_string(),
                reason: "storage service is not running".into(),
            });
        }

        let version = self.state.schema_version();
        let mut pending = self.state.pending.lock().expect("pending lock poisoned");
        if !pending.contains_key(key) && pending.len() >= self.state.capacity {
            return Err(StorageError::QueueFull {
                address: self.address().to_string(),
                capacity: self.state.capacity,
            });
        }

        let (write, result) = match payload {
            Some(payload) => {
                let producer = meta
                    .producer
                    .as_deref()
                    .unwrap_or(&self.shared.config.producer_id);
                let envelope =
                    Envelope::seal(payload, version, producer, meta.timestamp_ms.unwrap_or_else(now_ms));
                let bytes = envelope.encode()?;
                let result = WriteResult {
                    key: key.to_string(),
                    bytes: bytes.len(),
                    crc32: envelope.crc32,
                    schema_version: version,
                };
                (PendingWrite::Put { bytes, envelope }, result)
            }
            None => (
                PendingWrite::Delete,
                WriteResult {
                    key: key.to_string(),
                    bytes: 0,
                    crc32: 0,
                    schema_version: version,
                },
            ),
        };

        // A newer write to the same key supersedes the queued one.
        let mut waiters = pending.remove(key).map(|e| e.waiters).unwrap_or_default();
        waiters.extend(waiter);
        pending.insert(
            key.to_string(),
            PendingEntry {
                write,
                result: result.clone(),
                waiters,
            },
        );
        Ok(result)
    }

    /// Verify the checksum and bring the payload to the current schema.
    fn open(&self, key: &str, envelope: Envelope) -> StorageResult<StoredRecord> {
        let address = self.address().to_string();
        if let Err((expected, actual)) = envelope.verify() {
            return Err(StorageError::Corrupted {
                address,
                key: key.to_string(),
                expected,
                actual,
            });
        }

        let current = self.state.schema_version();
        let stored = envelope.schema_version;
        let payload = if stored > current {
            return Err(StorageError::SchemaTooNew {
                address,
                key: key.to_string(),
                found: stored,
                supported: current,
            });
        } else if stored < current {
            self.state
                .schema
                .migrate(stored, current, envelope.payload)
                .map_err(|message| StorageError::Migration {
                    address,
                    key: key.to_string(),
                    from: stored,
                    to: current,
                    message,
                })?
        } else {
            envelope.payload
        };

        Ok(StoredRecord {
            key: key.to_string(),
            payload,
            schema_version: current,
            stored_version: stored,
            producer: envelope.producer,
            timestamp_ms: envelope.timestamp_ms,
            crc32: envelope.crc32,
        })
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("address", self.address())
            .field("schema_version", &self.schema_version())
            .field("disabled", &self.is_disabled())
            .finish()
    }
}
