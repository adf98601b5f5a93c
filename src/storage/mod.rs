//! Persistent storage service.
//!
//! Records live in stores addressed by a `namespace/domain/store` triple and
//! are wrapped in an [`Envelope`](codec::Envelope) carrying schema version,
//! producer, timestamp and a CRC-32 of the payload.
//!
//! Lifecycle:
//!
//! 1. [`StorageService::initialize`] starts the background worker, which
//!    flushes every `flush_interval_secs` and serves [`StorageService::flush_async`].
//! 2. [`StorageService::recover`] repairs whatever an unclean shutdown left
//!    behind and reports each action taken.
//! 3. Stores queue writes; [`StorageService::flush`] is the durability boundary.
//! 4. [`StorageService::shutdown`] drains on the worker, waits at most
//!    `shutdown_timeout_ms` and reports anything dropped.

pub mod backend;
pub mod codec;
pub mod ident;
pub mod store;

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;

pub use backend::{BackendOp, MemBackend, RedbBackend, StorageBackend};
pub use codec::Envelope;
pub use ident::{IdMode, StoreAddress, normalize_segment};
pub use store::{
    FixedSchema, FnSchema, PendingOp, SchemaDescriptor, Store, StoreMetrics, StoredRecord,
    WriteMeta, WriteResult,
};

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use store::StoreState;

/// Backend marker holding the session state.
const SESSION_MARKER: &str = "session";
const SESSION_RUNNING: &[u8] = b"running";
const SESSION_CLEAN: &[u8] = b"clean";

const PHASE_CREATED: u8 = 0;
const PHASE_RUNNING: u8 = 1;
const PHASE_STOPPED: u8 = 2;

/// Aggregate outcome of a flush or shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Stores that had pending writes.
    pub stores: usize,
    pub written: usize,
    pub deleted: usize,
    pub bytes: u64,
    /// `address: error` for every store whose flush failed.
    pub failed: Vec<String>,
    pub disabled: Vec<String>,
    /// Writes discarded without being persisted.
    pub dropped: usize,
}

impl FlushReport {
    fn absorb(&mut self, address: &StoreAddress, flush: store::StoreFlush) {
        if flush.written + flush.deleted > 0 || flush.error.is_some() {
            self.stores += 1;
        }
        self.written += flush.written;
        self.deleted += flush.deleted;
        self.bytes += flush.bytes;
        self.dropped += flush.dropped;
        if let Some(e) = flush.error {
            self.failed.push(format!("{address}: {e}"));
        }
        if flush.disabled {
            self.disabled.push(address.to_string());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryKind {
    /// A journaled write was applied.
    Replayed,
    /// A journaled write failed validation or was stale and was dropped.
    Discarded,
    /// A stored record failed its checksum and was moved aside.
    Quarantined,
    /// The previous session never reached a clean shutdown.
    UncleanShutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAction {
    pub kind: RecoveryKind,
    /// `namespace/domain/store`, or `*` for service-wide actions.
    pub address: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    pub actions: Vec<RecoveryAction>,
    pub work_needed: bool,
    pub unclean_shutdown: bool,
}

impl RecoveryReport {
    pub fn count(&self, kind: RecoveryKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }
}

/// State shared by the service, its worker and every store handle.
pub(crate) struct Shared {
    backend: Arc<dyn StorageBackend>,
    config: StorageConfig,
    phase: AtomicU8,
    stores: DashMap<StoreAddress, Arc<StoreState>>,
    next_batch: AtomicU64,
    unclean: AtomicBool,
}

impl Shared {
    pub(crate) fn is_running(&self) -> bool {
        self.phase.load(Ordering::Acquire) == PHASE_RUNNING
    }

    pub(crate) fn next_batch(&self) -> u64 {
        self.next_batch.fetch_add(1, Ordering::Relaxed)
    }

    fn stores_sorted(&self) -> Vec<Arc<StoreState>> {
        let mut stores: Vec<Arc<StoreState>> = self.stores.iter().map(|e| Arc::clone(e.value())).collect();
        stores.sort_by(|a, b| a.address().cmp(b.address()));
        stores
    }

    fn flush_all(&self) -> FlushReport {
        let mut report = FlushReport::default();
        for state in self.stores_sorted() {
            let flush = state.flush(self);
            report.absorb(state.address(), flush);
        }
        report
    }

    /// Flush stores in order until `until` passes.
    fn drain(&self, until: Instant) -> FlushReport {
        let mut report = FlushReport::default();
        for state in self.stores_sorted() {
            if Instant::now() >= until {
                break;
            }
            let flush = state.flush(self);
            report.absorb(state.address(), flush);
        }
        report
    }
}

enum Command {
    Flush(mpsc::Sender<StorageResult<FlushReport>>),
    /// Drain until the deadline, reply, then exit.
    Stop {
        until: Instant,
        reply: mpsc::Sender<FlushReport>,
    },
}

struct Worker {
    tx: mpsc::Sender<Command>,
    handle: JoinHandle<()>,
}

/// Namespaced, checksummed, asynchronously flushed key/value storage.
pub struct StorageService {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl StorageService {
    pub fn new(backend: Arc<dyn StorageBackend>, config: StorageConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                backend,
                config,
                phase: AtomicU8::new(PHASE_CREATED),
                stores: DashMap::new(),
                next_batch: AtomicU64::new(1),
                unclean: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn in_memory(config: StorageConfig) -> Self {
        Self::new(Arc::new(MemBackend::new()), config)
    }

    /// Open a redb-backed service in `data_dir`.
    pub fn open(data_dir: &Path, config: StorageConfig) -> StorageResult<Self> {
        Ok(Self::new(Arc::new(RedbBackend::open(data_dir)?), config))
    }

    pub fn config(&self) -> &StorageConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Start the service: note an unclean previous session, mark this one
    /// as running and spawn the flush worker. Idempotent while running.
    pub fn initialize(&self) -> StorageResult<()> {
        match self.shared.phase.load(Ordering::Acquire) {
            PHASE_RUNNING => return Ok(()),
            PHASE_STOPPED => {
                return Err(StorageError::Disabled {
                    address: "*".into(),
                    reason: "storage service was shut down".into(),
                });
            }
            _ => {}
        }

        let backend = &self.shared.backend;
        let unclean = backend.marker(SESSION_MARKER)?.as_deref() == Some(SESSION_RUNNING);
        self.shared.unclean.store(unclean, Ordering::Relaxed);
        backend.set_marker(SESSION_MARKER, SESSION_RUNNING)?;

        let last_batch = backend
            .journal_entries()?
            .last()
            .map(|(b, _)| *b)
            .unwrap_or(0);
        self.shared.next_batch.store(last_batch + 1, Ordering::Relaxed);

        self.shared.phase.store(PHASE_RUNNING, Ordering::Release);
        self.spawn_worker()?;

        tracing::info!(
            unclean_previous_session = unclean,
            flush_interval_secs = self.shared.config.flush_interval_secs,
            "storage service initialized"
        );
        Ok(())
    }

    fn spawn_worker(&self) -> StorageResult<()> {
        let (tx, rx) = mpsc::channel::<Command>();
        let shared = Arc::clone(&self.shared);
        let interval = Duration::from_secs(self.shared.config.flush_interval_secs.max(1));
        let handle = std::thread::Builder::new()
            .name("multiblock-storage".into())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(interval) {
                        Ok(Command::Flush(reply)) => {
                            let _ = reply.send(Ok(shared.flush_all()));
                        }
                        Ok(Command::Stop { until, reply }) => {
                            let _ = reply.send(shared.drain(until));
                            break;
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let report = shared.flush_all();
                            if report.stores > 0 {
                                tracing::debug!(
                                    written = report.written,
                                    deleted = report.deleted,
                                    failed = report.failed.len(),
                                    "periodic flush"
                                );
                            }
                        }
                    }
                }
            })?;
        *self.worker.lock().expect("worker lock poisoned") = Some(Worker { tx, handle });
        Ok(())
    }

    /// Have the worker drain until `until` and exit, waiting no later than
    /// `limit`. Returns `None` if the worker did not answer in time; it is
    /// then left running detached and finishes on its own.
    fn stop_worker(&self, until: Instant, limit: Instant) -> Option<FlushReport> {
        let Some(worker) = self.worker.lock().expect("worker lock poisoned").take() else {
            return Some(FlushReport::default());
        };
        let (reply, rx) = mpsc::channel();
        if worker.tx.send(Command::Stop { until, reply }).is_err() {
            tracing::warn!("storage worker exited early");
            return Some(FlushReport::default());
        }
        match rx.recv_timeout(limit.saturating_duration_since(Instant::now())) {
            Ok(report) => {
                if worker.handle.join().is_err() {
                    tracing::warn!("storage worker panicked");
                }
                Some(report)
            }
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                tracing::warn!("storage worker panicked");
                Some(FlushReport::default())
            }
        }
    }

    /// Repair the backend after startup. Run once, before restoring state.
    ///
    /// Journaled batches are replayed op by op: writes whose envelope
    /// validates (and is not older than the stored record) are applied,
    /// the rest are discarded. Stored records failing their checksum are
    /// quarantined.
    pub fn recover(&self) -> StorageResult<RecoveryReport> {
        if !self.shared.is_running() {
            return Err(StorageError::NotInitialized);
        }
        let backend = &self.shared.backend;
        let mut report = RecoveryReport {
            unclean_shutdown: self.shared.unclean.load(Ordering::Relaxed),
            ..Default::default()
        };
        if report.unclean_shutdown {
            report.actions.push(RecoveryAction {
                kind: RecoveryKind::UncleanShutdown,
                address: "*".into(),
                detail: "previous session did not shut down cleanly".into(),
            });
        }

        for (batch, ops) in backend.journal_entries()? {
            let mut apply = Vec::with_capacity(ops.len());
            for op in ops {
                let (address, key) = describe_key(op.key());
                match replay_check(backend.as_ref(), &op) {
                    Ok(()) => {
                        report.actions.push(RecoveryAction {
                            kind: RecoveryKind::Replayed,
                            address,
                            detail: format!("{key} (batch {batch})"),
                        });
                        apply.push(op);
                    }
                    Err(reason) => report.actions.push(RecoveryAction {
                        kind: RecoveryKind::Discarded,
                        address,
                        detail: format!("{key} (batch {batch}): {reason}"),
                    }),
                }
            }
            backend.commit(batch, &apply)?;
        }

        for (full, bytes) in backend.scan_prefix("")? {
            let problem = match Envelope::decode(&bytes) {
                Err(e) => Some(e.to_string()),
                Ok(envelope) => envelope.verify().err().map(|(expected, actual)| {
                    format!("crc expected {expected:08x}, got {actual:08x}")
                }),
            };
            if let Some(problem) = problem {
                backend.quarantine(&full)?;
                let (address, key) = describe_key(&full);
                report.actions.push(RecoveryAction {
                    kind: RecoveryKind::Quarantined,
                    address,
                    detail: format!("{key}: {problem}"),
                });
            }
        }

        report.work_needed = !report.actions.is_empty();
        tracing::info!(
            actions = report.actions.len(),
            replayed = report.count(RecoveryKind::Replayed),
            discarded = report.count(RecoveryKind::Discarded),
            quarantined = report.count(RecoveryKind::Quarantined),
            unclean = report.unclean_shutdown,
            "storage recovery complete"
        );
        Ok(report)
    }

    /// Flush every store now.
    pub fn flush(&self) -> FlushReport {
        if !self.shared.is_running() {
            return FlushReport::default();
        }
        self.shared.flush_all()
    }

    /// Ask the worker to flush; the handle resolves with its report.
    pub fn flush_async(&self) -> PendingOp<FlushReport> {
        let worker = self.worker.lock().expect("worker lock poisoned");
        match worker.as_ref() {
            Some(worker) => {
                let (tx, op) = PendingOp::channel();
                match worker.tx.send(Command::Flush(tx)) {
                    Ok(()) => op,
                    Err(_) => PendingOp::ready(Err(StorageError::NotInitialized)),
                }
            }
            None => PendingOp::ready(Err(StorageError::NotInitialized)),
        }
    }

    /// Stop the service. A graceful shutdown drains pending writes on the
    /// worker and waits for it at most `shutdown_timeout_ms`; whatever is
    /// still queued or in flight after that is dropped and counted. Stores
    /// become disabled handles afterwards.
    ///
    /// A shutdown that times out leaves the session marked as running, so
    /// the next start runs recovery over the journal.
    pub fn shutdown(&self, graceful: bool) -> FlushReport {
        if self
            .shared
            .phase
            .compare_exchange(PHASE_RUNNING, PHASE_STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return FlushReport::default();
        }

        let now = Instant::now();
        let limit = now + Duration::from_millis(self.shared.config.shutdown_timeout_ms);
        let until = if graceful { limit } else { now };
        let stopped = self.stop_worker(until, limit);
        let timed_out = stopped.is_none();
        if timed_out {
            tracing::warn!(
                timeout_ms = self.shared.config.shutdown_timeout_ms,
                "storage drain did not finish in time"
            );
        }

        let mut report = stopped.unwrap_or_default();
        for state in self.shared.stores_sorted() {
            report.dropped += state.disable("storage service is shut down");
            // Anything a timed-out flush still holds was never confirmed.
            if timed_out {
                report.dropped += state.in_flight_len();
            }
        }

        if !timed_out {
            if let Err(e) = self.shared.backend.set_marker(SESSION_MARKER, SESSION_CLEAN) {
                tracing::warn!(error = %e, "failed to record clean shutdown");
            }
        }
        tracing::info!(
            graceful,
            timed_out,
            written = report.written,
            dropped = report.dropped,
            "storage service shut down"
        );
        report
    }

    /// Start addressing a store. Fails only in strict mode on a bad id.
    pub fn namespace(&self, id: &str) -> StorageResult<NamespaceHandle<'_>> {
        Ok(NamespaceHandle {
            service: self,
            namespace: self.normalize(id)?,
        })
    }

    fn normalize(&self, raw: &str) -> StorageResult<String> {
        let config = &self.shared.config;
        normalize_segment(raw, config.id_mode, config.log_normalization)
    }

    fn open_store(&self, address: StoreAddress, schema: Arc<dyn SchemaDescriptor>) -> Store {
        let capacity = self.shared.config.max_pending_writes;
        if !self.shared.is_running() {
            let state = StoreState::new(address, schema, capacity);
            state.disable("storage service is not running");
            return Store::new(Arc::new(state), Arc::clone(&self.shared));
        }

        let state = self
            .shared
            .stores
            .entry(address.clone())
            .or_insert_with(|| Arc::new(StoreState::new(address.clone(), Arc::clone(&schema), capacity)))
            .value()
            .clone();
        if state.schema_version() != schema.schema_version() {
            tracing::warn!(
                store = %address,
                open = state.schema_version(),
                requested = schema.schema_version(),
                "store already open with a different schema version, keeping the first"
            );
        }
        Store::new(state, Arc::clone(&self.shared))
    }

    /// Record keys and checksum status of one store, without decoding
    /// payloads. Used by diagnostics.
    pub fn inspect(&self, address: &StoreAddress) -> StorageResult<Vec<(String, Result<Envelope, String>)>> {
        let prefix = address.key_prefix();
        Ok(self
            .shared
            .backend
            .scan_prefix(&prefix)?
            .into_iter()
            .map(|(full, bytes)| {
                let key = full.strip_prefix(&prefix).unwrap_or(&full).to_string();
                let status = Envelope::decode(&bytes)
                    .map_err(|e| e.to_string())
                    .and_then(|env| match env.verify() {
                        Ok(()) => Ok(env),
                        Err((expected, actual)) => {
                            Err(format!("crc expected {expected:08x}, got {actual:08x}"))
                        }
                    });
                (key, status)
            })
            .collect())
    }
}

impl Drop for StorageService {
    fn drop(&mut self) {
        // Without shutdown() the session marker stays "running", so the
        // next initialize() reports an unclean shutdown.
        let now = Instant::now();
        let limit = now + Duration::from_millis(self.shared.config.shutdown_timeout_ms);
        if self.stop_worker(now, limit).is_none() {
            tracing::warn!("storage worker still busy at drop, detaching");
        }
    }
}

impl std::fmt::Debug for StorageService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageService")
            .field("running", &self.is_running())
            .field("stores", &self.shared.stores.len())
            .finish()
    }
}

/// `namespace(..)` step of the store address builder.
pub struct NamespaceHandle<'a> {
    service: &'a StorageService,
    namespace: String,
}

impl<'a> NamespaceHandle<'a> {
    pub fn domain(&self, id: &str) -> StorageResult<DomainHandle<'a>> {
        Ok(DomainHandle {
            service: self.service,
            namespace: self.namespace.clone(),
            domain: self.service.normalize(id)?,
        })
    }
}

/// `domain(..)` step of the store address builder.
pub struct DomainHandle<'a> {
    service: &'a StorageService,
    namespace: String,
    domain: String,
}

impl DomainHandle<'_> {
    /// Open (or reuse) a store. Before `initialize()` or after `shutdown()`
    /// this returns a disabled handle.
    pub fn store(&self, id: &str, schema: Arc<dyn SchemaDescriptor>) -> StorageResult<Store> {
        let address = StoreAddress {
            namespace: self.namespace.clone(),
            domain: self.domain.clone(),
            store: self.service.normalize(id)?,
        };
        Ok(self.service.open_store(address, schema))
    }
}

fn describe_key(full: &str) -> (String, String) {
    match StoreAddress::split_key(full) {
        Some((address, key)) => (address.to_string(), key.to_string()),
        None => ("?".into(), full.to_string()),
    }
}

/// Whether a journaled op may be applied during recovery.
fn replay_check(backend: &dyn StorageBackend, op: &BackendOp) -> Result<(), String> {
    let BackendOp::Put { key, bytes } = op else {
        return Ok(());
    };
    let envelope = Envelope::decode(bytes).map_err(|e| e.to_string())?;
    envelope
        .verify()
        .map_err(|(expected, actual)| format!("crc expected {expected:08x}, got {actual:08x}"))?;
    if let Some(existing) = backend.get(key).map_err(|e| e.to_string())? {
        if let Ok(current) = Envelope::decode(&existing) {
            if current.timestamp_ms > envelope.timestamp_ms {
                return Err("stored record is newer".into());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn service() -> StorageService {
        let s = StorageService::in_memory(StorageConfig::default());
        s.initialize().unwrap();
        s
    }

    fn store(s: &StorageService, version: u32) -> Store {
        s.namespace("test")
            .unwrap()
            .domain("unit")
            .unwrap()
            .store("records", Arc::new(FixedSchema(version)))
            .unwrap()
    }

    #[test]
    fn write_read_roundtrip_through_flush() {
        let s = service();
        let st = store(&s, 1);
        let ack = st.write("k", b"payload".to_vec(), WriteMeta::default()).unwrap();
        assert_eq!(st.metrics().pending, 1);

        // Visible before the flush.
        assert_eq!(st.read("k").unwrap().unwrap().payload, b"payload");

        let report = s.flush();
        assert_eq!(report.written, 1);
        let rec = st.read("k").unwrap().unwrap();
        assert_eq!(rec.payload, b"payload");
        assert_eq!(rec.crc32, ack.crc32);
        assert_eq!(rec.producer, "multiblock");

        let m = st.metrics();
        assert_eq!(m.pending, 0);
        assert_eq!(m.total_writes, 1);
        assert!(m.last_write_ms.is_some());
    }

    #[test]
    fn delete_hides_record() {
        let s = service();
        let st = store(&s, 1);
        st.write("k", vec![1], WriteMeta::default()).unwrap();
        s.flush();
        st.delete("k", WriteMeta::default()).unwrap();
        assert!(st.read("k").unwrap().is_none());
        s.flush();
        assert!(st.read("k").unwrap().is_none());
        assert!(st.read_all().unwrap().is_empty());
    }

    #[test]
    fn corrupted_payload_is_reported() {
        let backend = MemBackend::new();
        let s = StorageService::new(Arc::new(backend.clone()), StorageConfig::default());
        s.initialize().unwrap();
        let st = store(&s, 1);
        st.write("k", b"abc".to_vec(), WriteMeta::default()).unwrap();
        s.flush();

        let full = st.address().record_key("k");
        let mut env = Envelope::decode(&backend.get(&full).unwrap().unwrap()).unwrap();
        env.payload[1] ^= 0x20;
        backend.put_raw(&full, env.encode().unwrap());

        assert!(matches!(st.read("k"), Err(StorageError::Corrupted { .. })));
        assert!(st.read_all().unwrap().is_empty());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let s = service();
        store(&s, 3).write("k", vec![1], WriteMeta::default()).unwrap();
        s.flush();

        let s2 = StorageService::new(Arc::clone(&s.shared.backend), StorageConfig::default());
        s2.initialize().unwrap();
        let old = store(&s2, 2);
        assert!(matches!(old.read("k"), Err(StorageError::SchemaTooNew { found: 3, supported: 2, .. })));
    }

    #[test]
    fn migrator_runs_once_per_old_read() {
        let s = service();
        store(&s, 1).write("k", b"v1".to_vec(), WriteMeta::default()).unwrap();
        s.flush();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let s2 = StorageService::new(Arc::clone(&s.shared.backend), StorageConfig::default());
        s2.initialize().unwrap();
        let st = s2
            .namespace("test")
            .unwrap()
            .domain("unit")
            .unwrap()
            .store(
                "records",
                Arc::new(FnSchema::new(2, move |from, to, mut payload: Vec<u8>| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    assert_eq!((from, to), (1, 2));
                    payload.extend_from_slice(b"+v2");
                    Ok(payload)
                })),
            )
            .unwrap();

        let rec = st.read("k").unwrap().unwrap();
        assert_eq!(rec.payload, b"v1+v2");
        assert_eq!(rec.stored_version, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        st.write("fresh", b"new".to_vec(), WriteMeta::default()).unwrap();
        s2.flush();
        assert_eq!(st.read("fresh").unwrap().unwrap().payload, b"new");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn queue_capacity_is_enforced() {
        let config = StorageConfig {
            max_pending_writes: 2,
            ..Default::default()
        };
        let s = StorageService::in_memory(config);
        s.initialize().unwrap();
        let st = store(&s, 1);
        st.write("a", vec![1], WriteMeta::default()).unwrap();
        st.write("b", vec![2], WriteMeta::default()).unwrap();
        // Overwriting a queued key does not need a new slot.
        st.write("a", vec![3], WriteMeta::default()).unwrap();
        assert!(matches!(
            st.write("c", vec![4], WriteMeta::default()),
            Err(StorageError::QueueFull { capacity: 2, .. })
        ));
        assert_eq!(st.metrics().capacity, 0);
    }

    #[test]
    fn async_write_resolves_after_flush() {
        let s = service();
        let st = store(&s, 1);
        let op = st.write_async("k", vec![9], WriteMeta::default());
        assert!(op.try_result().is_none());
        s.flush_async().wait().unwrap();
        let ack = op.wait().unwrap();
        assert_eq!(ack.key, "k");
    }

    #[test]
    fn stores_before_initialize_are_disabled() {
        let s = StorageService::in_memory(StorageConfig::default());
        let st = store(&s, 1);
        assert!(st.is_disabled());
        assert_eq!(st.metrics().capacity, 0);
        assert!(matches!(
            st.write("k", vec![1], WriteMeta::default()),
            Err(StorageError::Disabled { .. })
        ));
        assert!(st.read("k").unwrap().is_none());
    }

    #[test]
    fn strict_mode_rejects_bad_segments() {
        let config = StorageConfig {
            id_mode: IdMode::Strict,
            ..Default::default()
        };
        let s = StorageService::in_memory(config);
        assert!(s.namespace("../etc").is_err());
        assert!(s.namespace("ok").unwrap().domain("has space").is_err());
    }

    #[test]
    fn shutdown_drains_and_disables() {
        let s = service();
        let st = store(&s, 1);
        st.write("k", vec![1], WriteMeta::default()).unwrap();
        let report = s.shutdown(true);
        assert_eq!(report.written, 1);
        assert_eq!(report.dropped, 0);
        assert!(st.is_disabled());
        assert!(s.initialize().is_err());
    }

    #[test]
    fn hard_shutdown_drops_pending() {
        let s = service();
        let st = store(&s, 1);
        st.write("a", vec![1], WriteMeta::default()).unwrap();
        st.write("b", vec![2], WriteMeta::default()).unwrap();
        let report = s.shutdown(false);
        assert_eq!(report.dropped, 2);
        assert_eq!(report.written, 0);
    }

    #[test]
    fn recovery_replays_valid_journal_and_discards_bad() {
        let backend = MemBackend::new();
        let good = Envelope::seal(b"ok".to_vec(), 1, "test", 10).encode().unwrap();
        let mut bad_env = Envelope::seal(b"bad".to_vec(), 1, "test", 10);
        bad_env.crc32 ^= 1;
        let bad = bad_env.encode().unwrap();
        backend
            .journal(
                4,
                &[
                    BackendOp::Put { key: "test/unit/records:good".into(), bytes: good },
                    BackendOp::Put { key: "test/unit/records:bad".into(), bytes: bad },
                ],
            )
            .unwrap();
        backend.set_marker(SESSION_MARKER, SESSION_RUNNING).unwrap();

        let s = StorageService::new(Arc::new(backend.clone()), StorageConfig::default());
        s.initialize().unwrap();
        let report = s.recover().unwrap();
        assert!(report.work_needed);
        assert!(report.unclean_shutdown);
        assert_eq!(report.count(RecoveryKind::Replayed), 1);
        assert_eq!(report.count(RecoveryKind::Discarded), 1);
        assert!(backend.journal_entries().unwrap().is_empty());
        assert_eq!(store(&s, 1).read("good").unwrap().unwrap().payload, b"ok");

        // Batch ids continue after the journaled one.
        assert!(s.shared.next_batch() > 4);
    }

    #[test]
    fn recovery_on_clean_backend_needs_no_work() {
        let s = service();
        let report = s.recover().unwrap();
        assert!(!report.work_needed);
        assert!(report.actions.is_empty());
    }

    #[test]
    fn recover_requires_initialize() {
        let s = StorageService::in_memory(StorageConfig::default());
        assert!(matches!(s.recover(), Err(StorageError::NotInitialized)));
    }

    struct FailingBackend(MemBackend);

    impl StorageBackend for FailingBackend {
        fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
            self.0.get(key)
        }
        fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
            self.0.scan_prefix(prefix)
        }
        fn journal(&self, _batch: u64, _ops: &[BackendOp]) -> StorageResult<()> {
            Err(StorageError::Io {
                source: std::io::Error::other("disk full"),
            })
        }
        fn commit(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
            self.0.commit(batch, ops)
        }
        fn journal_entries(&self) -> StorageResult<Vec<(u64, Vec<BackendOp>)>> {
            self.0.journal_entries()
        }
        fn quarantine(&self, key: &str) -> StorageResult<()> {
            self.0.quarantine(key)
        }
        fn quarantined(&self) -> StorageResult<Vec<String>> {
            self.0.quarantined()
        }
        fn marker(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
            self.0.marker(name)
        }
        fn set_marker(&self, name: &str, value: &[u8]) -> StorageResult<()> {
            self.0.set_marker(name, value)
        }
    }

    #[test]
    fn repeated_flush_failures_disable_the_store() {
        let s = StorageService::new(Arc::new(FailingBackend(MemBackend::new())), StorageConfig::default());
        s.initialize().unwrap();
        let st = store(&s, 1);
        let op = st.write_async("k", vec![1], WriteMeta::default());

        let first = s.flush();
        assert_eq!(first.failed.len(), 1);
        assert!(!st.is_disabled());
        assert_eq!(st.metrics().pending, 1);

        s.flush();
        let third = s.flush();
        assert_eq!(third.disabled.len(), 1);
        assert_eq!(third.dropped, 1);
        assert!(st.is_disabled());
        assert_eq!(st.metrics().capacity, 0);
        assert!(matches!(op.wait(), Err(StorageError::Disabled { .. })));
    }

    #[test]
    fn store_flush_returns_the_backend_error() {
        let s = StorageService::new(Arc::new(FailingBackend(MemBackend::new())), StorageConfig::default());
        s.initialize().unwrap();
        let st = store(&s, 1);
        st.write("k", vec![1], WriteMeta::default()).unwrap();

        let err = st.flush().unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }), "{err:?}");
        assert!(err.to_string().contains("disk full"));
        // The write is back in the queue and still readable.
        assert_eq!(st.metrics().pending, 1);
        assert_eq!(st.read("k").unwrap().unwrap().payload, vec![1]);
    }
}
