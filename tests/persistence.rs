//! Persistence and recovery tests.
//!
//! These tests verify that instances survive engine restart, that tampered
//! records surface as corruption, and that schema migration runs exactly
//! when it should.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use multiblock::behavior::{ActionPhase, ActionSpec};
use multiblock::config::{EngineConfig, StorageConfig};
use multiblock::engine::Engine;
use multiblock::error::{StorageError, StorageResult};
use multiblock::geom::{CellPos, WorldId};
use multiblock::predicate::CellPredicate;
use multiblock::storage::{
    BackendOp, Envelope, FixedSchema, FnSchema, MemBackend, RecoveryKind, RedbBackend,
    StorageBackend, StorageService, Store, WriteMeta,
};
use multiblock::template::MultiblockTemplate;
use multiblock::trigger::{self, AssemblyContext};
use multiblock::world::{Cell, GridWorld};

fn pos(x: i32, y: i32, z: i32) -> CellPos {
    CellPos::new(WorldId(0), x, y, z)
}

fn furnace() -> MultiblockTemplate {
    MultiblockTemplate::builder("demo:furnace", CellPredicate::exact("iron"))
        .entry([1, 0, 0], CellPredicate::exact("stone"))
        .trigger(trigger::MANUAL_ONLY)
        .variable("heat", 0)
        .build()
        .unwrap()
}

fn furnace_world(x: i32) -> GridWorld {
    let mut world = GridWorld::new();
    world.set(pos(x, 0, 0), Cell::new("iron"));
    world.set(pos(x + 1, 0, 0), Cell::new("stone"));
    world
}

fn persistent_engine(dir: &std::path::Path) -> Engine {
    let engine = Engine::new(EngineConfig::with_data_dir(dir)).unwrap();
    engine.register_template(furnace()).unwrap();
    engine
}

/// In-memory backend whose commits take `delay`.
struct SlowBackend {
    inner: MemBackend,
    delay: Duration,
}

impl StorageBackend for SlowBackend {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn scan_prefix(&self, prefix: &str) -> StorageResult<Vec<(String, Vec<u8>)>> {
        self.inner.scan_prefix(prefix)
    }
    fn journal(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        self.inner.journal(batch, ops)
    }
    fn commit(&self, batch: u64, ops: &[BackendOp]) -> StorageResult<()> {
        thread::sleep(self.delay);
        self.inner.commit(batch, ops)
    }
    fn journal_entries(&self) -> StorageResult<Vec<(u64, Vec<BackendOp>)>> {
        self.inner.journal_entries()
    }
    fn quarantine(&self, key: &str) -> StorageResult<()> {
        self.inner.quarantine(key)
    }
    fn quarantined(&self) -> StorageResult<Vec<String>> {
        self.inner.quarantined()
    }
    fn marker(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        self.inner.marker(name)
    }
    fn set_marker(&self, name: &str, value: &[u8]) -> StorageResult<()> {
        self.inner.set_marker(name, value)
    }
}

fn slow_service(backend: &MemBackend, delay: Duration, config: StorageConfig) -> StorageService {
    let service = StorageService::new(
        Arc::new(SlowBackend {
            inner: backend.clone(),
            delay,
        }),
        config,
    );
    service.initialize().unwrap();
    service
}

fn open_store(service: &StorageService, version: u32) -> Store {
    service
        .namespace("test")
        .unwrap()
        .domain("persistence")
        .unwrap()
        .store("records", Arc::new(FixedSchema(version)))
        .unwrap()
}

#[test]
fn instances_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    // First session: assemble two furnaces and shut down cleanly.
    {
        let engine = persistent_engine(dir.path());
        assert!(engine.assemble(&furnace_world(0), pos(0, 0, 0), &AssemblyContext::manual()).is_success());
        assert!(engine.assemble(&furnace_world(10), pos(10, 0, 0), &AssemblyContext::manual()).is_success());
        let handle = engine.registry().instance_at(pos(0, 0, 0)).unwrap();
        handle.write().unwrap().set_variable("heat".into(), serde_json::json!(42));
        engine.shutdown(true);
    }

    // Second session: restore.
    {
        let engine = persistent_engine(dir.path());
        assert!(!engine.recovery_report().unclean_shutdown);
        assert_eq!(engine.restore_instances().unwrap(), 2);
        assert_eq!(engine.registry().len(), 2);
        assert!(engine.registry().is_reserved(pos(11, 0, 0)));

        let handle = engine.registry().instance_at(pos(1, 0, 0)).unwrap();
        let instance = handle.read().unwrap();
        assert_eq!(instance.template_id(), "demo:furnace");
        assert_eq!(instance.variable("heat"), Some(&serde_json::json!(42)));
    }
}

#[test]
fn destroyed_instances_stay_gone_after_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let engine = persistent_engine(dir.path());
        engine.assemble(&furnace_world(0), pos(0, 0, 0), &AssemblyContext::manual());
        engine.flush();
        engine.on_cell_broken(pos(1, 0, 0), None);
        engine.shutdown(true);
    }
    let engine = persistent_engine(dir.path());
    assert_eq!(engine.restore_instances().unwrap(), 0);
    assert!(engine.registry().is_empty());
}

#[test]
fn dropping_without_shutdown_is_reported_as_unclean() {
    let backend = MemBackend::new();
    {
        let engine = Engine::with_backend(EngineConfig::in_memory(), Arc::new(backend.clone())).unwrap();
        engine.register_template(furnace()).unwrap();
        engine.assemble(&furnace_world(0), pos(0, 0, 0), &AssemblyContext::manual());
        engine.flush();
        // No shutdown.
    }
    let engine = Engine::with_backend(EngineConfig::in_memory(), Arc::new(backend)).unwrap();
    let report = engine.recovery_report();
    assert!(report.unclean_shutdown);
    assert!(report.work_needed);
    assert_eq!(report.count(RecoveryKind::UncleanShutdown), 1);

    // Flushed data is still there.
    engine.register_template(furnace()).unwrap();
    assert_eq!(engine.restore_instances().unwrap(), 1);
}

#[test]
fn tampered_record_surfaces_as_corruption_and_is_quarantined() {
    let dir = tempfile::TempDir::new().unwrap();

    {
        let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
        service.initialize().unwrap();
        let store = open_store(&service, 1);
        store.write("good", b"intact".to_vec(), WriteMeta::default()).unwrap();
        store.write("bad", b"pristine".to_vec(), WriteMeta::default()).unwrap();
        service.shutdown(true);
    }

    // Flip one payload byte without touching the stored checksum.
    {
        let backend = RedbBackend::open(dir.path()).unwrap();
        let key = "test/persistence/records:bad";
        let mut envelope = Envelope::decode(&backend.get(key).unwrap().unwrap()).unwrap();
        envelope.payload[0] ^= 0x01;
        let tampered = envelope.encode().unwrap();
        backend
            .commit(0, &[BackendOp::Put { key: key.into(), bytes: tampered }])
            .unwrap();
    }

    let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
    service.initialize().unwrap();
    let store = open_store(&service, 1);
    assert!(matches!(store.read("bad"), Err(StorageError::Corrupted { .. })));
    assert_eq!(store.read("good").unwrap().unwrap().payload, b"intact");

    let report = service.recover().unwrap();
    assert!(report.work_needed);
    assert_eq!(report.count(RecoveryKind::Quarantined), 1);
    let action = report
        .actions
        .iter()
        .find(|a| a.kind == RecoveryKind::Quarantined)
        .unwrap();
    assert_eq!(action.address, "test/persistence/records");
    assert!(action.detail.starts_with("bad"));

    // After quarantine the record is simply absent.
    assert!(store.read("bad").unwrap().is_none());
    assert_eq!(store.read_all().unwrap().len(), 1);
    service.shutdown(true);
}

#[test]
fn write_read_returns_identical_payload() {
    let dir = tempfile::TempDir::new().unwrap();
    let payload: Vec<u8> = (0..=255).collect();
    {
        let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
        service.initialize().unwrap();
        let ack = open_store(&service, 1)
            .write("bytes", payload.clone(), WriteMeta {
                producer: Some("tests".into()),
                timestamp_ms: Some(1_700_000_000_000),
            })
            .unwrap();
        assert_eq!(ack.crc32, multiblock::storage::codec::crc32(&payload));
        service.shutdown(true);
    }
    let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
    service.initialize().unwrap();
    let record = open_store(&service, 1).read("bytes").unwrap().unwrap();
    assert_eq!(record.payload, payload);
    assert_eq!(record.producer, "tests");
    assert_eq!(record.timestamp_ms, 1_700_000_000_000);
    service.shutdown(true);
}

#[test]
fn migrator_runs_once_per_old_record_read() {
    let dir = tempfile::TempDir::new().unwrap();
    {
        let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
        service.initialize().unwrap();
        open_store(&service, 1)
            .write("legacy", b"{\"heat\":1}".to_vec(), WriteMeta::default())
            .unwrap();
        service.shutdown(true);
    }

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
    service.initialize().unwrap();
    let store = service
        .namespace("test")
        .unwrap()
        .domain("persistence")
        .unwrap()
        .store(
            "records",
            Arc::new(FnSchema::new(2, move |from, to, payload: Vec<u8>| {
                counter.fetch_add(1, Ordering::SeqCst);
                if (from, to) != (1, 2) {
                    return Err(format!("unexpected migration {from}->{to}"));
                }
                let mut value: serde_json::Value =
                    serde_json::from_slice(&payload).map_err(|e| e.to_string())?;
                value["unit"] = serde_json::json!("celsius");
                serde_json::to_vec(&value).map_err(|e| e.to_string())
            })),
        )
        .unwrap();

    let record = store.read("legacy").unwrap().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&record.payload).unwrap();
    assert_eq!(value, serde_json::json!({"heat": 1, "unit": "celsius"}));
    assert_eq!(record.stored_version, 1);
    assert_eq!(record.schema_version, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    store.read("legacy").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // Records already at version 2 never reach the migrator.
    store.write("current", b"{}".to_vec(), WriteMeta::default()).unwrap();
    service.flush();
    store.read("current").unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    service.shutdown(true);
}

#[test]
fn newer_records_are_a_schema_mismatch() {
    let backend = MemBackend::new();
    {
        let service = StorageService::new(Arc::new(backend.clone()), StorageConfig::default());
        service.initialize().unwrap();
        open_store(&service, 5).write("k", vec![1, 2, 3], WriteMeta::default()).unwrap();
        service.shutdown(true);
    }
    let service = StorageService::new(Arc::new(backend), StorageConfig::default());
    service.initialize().unwrap();
    let err = open_store(&service, 4).read("k").unwrap_err();
    assert!(matches!(err, StorageError::SchemaTooNew { found: 5, supported: 4, .. }));
}

#[test]
fn interrupted_flush_is_replayed_from_journal() {
    let dir = tempfile::TempDir::new().unwrap();

    // Simulate a crash between journaling and applying a batch.
    {
        let backend = RedbBackend::open(dir.path()).unwrap();
        let sealed = Envelope::seal(b"journaled".to_vec(), 1, "multiblock", 5).encode().unwrap();
        backend
            .journal(9, &[BackendOp::Put { key: "test/persistence/records:late".into(), bytes: sealed }])
            .unwrap();
        backend.set_marker("session", b"running").unwrap();
    }

    let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
    service.initialize().unwrap();
    let report = service.recover().unwrap();
    assert!(report.unclean_shutdown);
    assert_eq!(report.count(RecoveryKind::Replayed), 1);
    assert_eq!(
        open_store(&service, 1).read("late").unwrap().unwrap().payload,
        b"journaled"
    );
    service.shutdown(true);

    // A second start has nothing left to do.
    let service = StorageService::open(dir.path(), StorageConfig::default()).unwrap();
    service.initialize().unwrap();
    let report = service.recover().unwrap();
    assert!(!report.work_needed);
    service.shutdown(true);
}

#[test]
fn ticked_state_survives_unclean_shutdown() {
    let boiler = || {
        MultiblockTemplate::builder("demo:boiler", CellPredicate::exact("iron"))
            .entry([1, 0, 0], CellPredicate::exact("stone"))
            .trigger(trigger::MANUAL_ONLY)
            .tick_interval(1)
            .variable("pressure", 0)
            .action(ActionPhase::Tick, ActionSpec::Increment { key: "pressure".into(), by: 1.0 })
            .build()
            .unwrap()
    };
    let backend = MemBackend::new();
    {
        let engine = Engine::with_backend(EngineConfig::in_memory(), Arc::new(backend.clone())).unwrap();
        engine.register_template(boiler()).unwrap();
        assert!(engine.assemble(&furnace_world(0), pos(0, 0, 0), &AssemblyContext::manual()).is_success());
        for tick in 1..=3 {
            engine.tick(tick);
        }
        engine.flush();
        // No shutdown.
    }

    let engine = Engine::with_backend(EngineConfig::in_memory(), Arc::new(backend)).unwrap();
    assert!(engine.recovery_report().unclean_shutdown);
    engine.register_template(boiler()).unwrap();
    assert_eq!(engine.restore_instances().unwrap(), 1);
    let handle = engine.registry().instance_at(pos(0, 0, 0)).unwrap();
    assert_eq!(handle.read().unwrap().variable("pressure"), Some(&serde_json::json!(3)));
}

#[test]
fn reads_see_writes_while_their_flush_is_in_flight() {
    let backend = MemBackend::new();
    let service = slow_service(&backend, Duration::from_millis(800), StorageConfig::default());
    let store = open_store(&service, 1);
    store.write("k", b"queued".to_vec(), WriteMeta::default()).unwrap();

    thread::scope(|scope| {
        let flusher = scope.spawn(|| store.flush());
        thread::sleep(Duration::from_millis(200));
        assert!(backend.get("test/persistence/records:k").unwrap().is_none());
        assert_eq!(store.read("k").unwrap().unwrap().payload, b"queued");
        assert_eq!(store.read_all().unwrap().len(), 1);
        flusher.join().unwrap().unwrap();
    });

    assert!(backend.get("test/persistence/records:k").unwrap().is_some());
    assert_eq!(store.read("k").unwrap().unwrap().payload, b"queued");
    service.shutdown(true);
}

#[test]
fn shutdown_gives_up_after_its_timeout() {
    let backend = MemBackend::new();
    let config = StorageConfig {
        shutdown_timeout_ms: 100,
        ..Default::default()
    };
    let service = slow_service(&backend, Duration::from_secs(3), config);
    let store = open_store(&service, 1);
    store.write("k", vec![1], WriteMeta::default()).unwrap();

    let started = Instant::now();
    let report = service.shutdown(true);
    assert!(started.elapsed() < Duration::from_secs(2), "shutdown took {:?}", started.elapsed());
    assert_eq!(report.written, 0);
    assert_eq!(report.dropped, 1);
    assert!(store.is_disabled());
    // The next start has to recover.
    assert_eq!(backend.marker("session").unwrap().as_deref(), Some(&b"running"[..]));
}

#[test]
fn background_worker_flushes_on_its_interval() {
    let backend = MemBackend::new();
    let config = StorageConfig {
        flush_interval_secs: 1,
        ..Default::default()
    };
    let service = StorageService::new(Arc::new(backend.clone()), config);
    service.initialize().unwrap();
    let store = open_store(&service, 1);
    store.write("k", b"periodic".to_vec(), WriteMeta::default()).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while backend.get("test/persistence/records:k").unwrap().is_none() {
        assert!(Instant::now() < deadline, "write never flushed by the worker");
        thread::sleep(Duration::from_millis(50));
    }
    assert_eq!(store.metrics().pending, 0);
    assert_eq!(store.metrics().total_writes, 1);
    service.shutdown(true);
}

#[test]
fn flush_async_resolves_once_writes_are_durable() {
    let backend = MemBackend::new();
    let service = StorageService::new(Arc::new(backend.clone()), StorageConfig::default());
    service.initialize().unwrap();
    let store = open_store(&service, 1);
    let write = store.write_async("k", b"async".to_vec(), WriteMeta::default());
    assert!(write.try_result().is_none());

    let report = service.flush_async().wait().unwrap();
    assert_eq!(report.stores, 1);
    assert_eq!(report.written, 1);
    assert_eq!(write.wait().unwrap().key, "k");
    assert!(backend.get("test/persistence/records:k").unwrap().is_some());

    service.shutdown(true);
    assert!(matches!(service.flush_async().wait(), Err(StorageError::NotInitialized)));
}
