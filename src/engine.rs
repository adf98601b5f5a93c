//! Engine facade: top-level API for the multiblock system.
//!
//! The `Engine` owns every subsystem, wires them together by explicit
//! injection and exposes the host event entry points (interact, place,
//! break, tick) plus instance persistence.

use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::assembly::{AssemblyCoordinator, AssemblyReport};
use crate::behavior::{ActionHandler, ActionPhase, ActionRegistry, ActionSummary};
use crate::capability::CapabilityFactory;
use crate::config::EngineConfig;
use crate::error::{MultiblockResult, StorageError, StorageResult, TemplateResult, TriggerResult};
use crate::geom::CellPos;
use crate::instance::{InstanceId, InstanceSnapshot, MultiblockInstance};
use crate::registry::{InstanceHandle, InstanceRegistry, TickSummary};
use crate::storage::{
    FixedSchema, FlushReport, MemBackend, RecoveryReport, StorageBackend, StorageService, Store,
    WriteMeta,
};
use crate::template::{self, MultiblockTemplate, TemplateSource};
use crate::trigger::{ActorId, AssemblyContext, AssemblyTrigger, TriggerRegistry};
use crate::world::World;

/// Store holding persistent instance snapshots.
pub const INSTANCE_NAMESPACE: &str = "multiblock";
pub const INSTANCE_DOMAIN: &str = "instances";
pub const INSTANCE_STORE: &str = "live";
pub const INSTANCE_SCHEMA_VERSION: u32 = 1;

/// Raised before an instance is destroyed by a broken cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreDestroyEvent {
    pub instance: InstanceId,
    pub template_id: String,
    pub anchor: CellPos,
    pub broken: CellPos,
    pub actor: Option<ActorId>,
    cancelled: bool,
}

impl PreDestroyEvent {
    /// Veto the destruction.
    pub fn cancel(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Observer of instance destruction. Every listener sees the event, even
/// one already cancelled.
pub trait BreakListener: Send + Sync {
    fn pre_destroy(&self, event: &mut PreDestroyEvent);
}

impl<F> BreakListener for F
where
    F: Fn(&mut PreDestroyEvent) + Send + Sync,
{
    fn pre_destroy(&self, event: &mut PreDestroyEvent) {
        self(event)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakOutcome {
    /// No instance reserves the broken cell.
    NotMultiblock,
    Vetoed(InstanceId),
    Destroyed(InstanceId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InteractOutcome {
    /// The cell belongs to a live instance; its on-interact actions ran.
    Interacted {
        instance: InstanceId,
        summary: ActionSummary,
        destroyed: bool,
    },
    /// The cell was free, so assembly was attempted.
    Assembly(AssemblyReport),
}

/// The multiblock engine.
pub struct Engine {
    config: EngineConfig,
    actions: Arc<ActionRegistry>,
    triggers: Arc<TriggerRegistry>,
    registry: Arc<InstanceRegistry>,
    coordinator: AssemblyCoordinator,
    storage: StorageService,
    instances: Store,
    recovery: RecoveryReport,
    break_listeners: RwLock<Vec<Arc<dyn BreakListener>>>,
}

impl Engine {
    /// Create an engine. With a `data_dir` the redb backend is used,
    /// otherwise everything stays in memory.
    ///
    /// Storage is initialized and recovered, and templates in
    /// `templates_dir` are registered as user templates. Saved instances
    /// are not restored until [`Engine::restore_instances`] is called, so
    /// hosts can register built-in templates first.
    pub fn new(config: EngineConfig) -> MultiblockResult<Self> {
        let backend: Arc<dyn StorageBackend> = match &config.data_dir {
            Some(dir) => Arc::new(crate::storage::RedbBackend::open(dir)?),
            None => Arc::new(MemBackend::new()),
        };
        Self::with_backend(config, backend)
    }

    /// Create an engine on an explicit storage backend.
    pub fn with_backend(config: EngineConfig, backend: Arc<dyn StorageBackend>) -> MultiblockResult<Self> {
        let storage = StorageService::new(backend, config.storage.clone());
        storage.initialize()?;
        let recovery = storage.recover()?;
        let instances = storage
            .namespace(INSTANCE_NAMESPACE)?
            .domain(INSTANCE_DOMAIN)?
            .store(INSTANCE_STORE, Arc::new(FixedSchema(INSTANCE_SCHEMA_VERSION)))?;

        let actions = Arc::new(ActionRegistry::new());
        let triggers = Arc::new(TriggerRegistry::new());
        let registry = Arc::new(InstanceRegistry::new(Arc::clone(&actions)));
        let coordinator = AssemblyCoordinator::new(Arc::clone(&registry), Arc::clone(&triggers));

        let engine = Self {
            config,
            actions,
            triggers,
            registry,
            coordinator,
            storage,
            instances,
            recovery,
            break_listeners: RwLock::new(Vec::new()),
        };

        if let Some(dir) = engine.config.templates_dir.clone() {
            let loaded = engine.load_templates(&dir, TemplateSource::User)?;
            tracing::info!(dir = %dir.display(), templates = loaded, "templates loaded");
        }

        tracing::info!(
            persistent = engine.config.data_dir.is_some(),
            recovery_actions = engine.recovery.actions.len(),
            templates = engine.registry.types().len(),
            "multiblock engine initialized"
        );
        Ok(engine)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_template(&self, template: MultiblockTemplate) -> TemplateResult<Arc<MultiblockTemplate>> {
        self.registry.register_type(template)
    }

    /// Load every `*.toml` template in `dir`. Returns how many registered.
    pub fn load_templates(&self, dir: &Path, source: TemplateSource) -> TemplateResult<usize> {
        let templates = template::load_dir(dir, source, self.config.default_tick_interval)?;
        let mut count = 0;
        for t in templates {
            self.registry.register_type(t)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn register_trigger(&self, trigger: Arc<dyn AssemblyTrigger>) -> TriggerResult<()> {
        self.triggers.register(trigger)
    }

    pub fn register_action(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        self.actions.register(name, handler);
    }

    pub fn register_capability_factory(&self, owner: impl Into<String>, factory: CapabilityFactory) {
        self.registry.register_capability_factory(owner, factory);
    }

    pub fn add_break_listener(&self, listener: Arc<dyn BreakListener>) {
        self.break_listeners
            .write()
            .expect("listener lock poisoned")
            .push(listener);
    }

    // -----------------------------------------------------------------------
    // Host events
    // -----------------------------------------------------------------------

    /// Attempt assembly with `pos` as the controller.
    pub fn assemble(&self, world: &dyn World, pos: CellPos, ctx: &AssemblyContext) -> AssemblyReport {
        let report = self.coordinator.try_assemble_at(world, pos, ctx);
        self.persist_report(&report);
        report
    }

    /// A cell was placed; try place-triggered templates around it.
    pub fn on_cell_placed(&self, world: &dyn World, pos: CellPos, ctx: &AssemblyContext) -> AssemblyReport {
        let report = self.coordinator.try_assemble_from_placed(world, pos, ctx);
        self.persist_report(&report);
        report
    }

    /// An actor interacted with `pos`: run on-interact actions of the
    /// instance there, or try to assemble one with `pos` as controller.
    pub fn on_actor_interact(&self, world: &dyn World, pos: CellPos, ctx: &AssemblyContext) -> InteractOutcome {
        let Some(handle) = self.registry.instance_at(pos) else {
            return InteractOutcome::Assembly(self.assemble(world, pos, ctx));
        };

        let id = handle.read().expect("instance lock poisoned").id();
        let summary = self.registry.run_phase(&handle, ActionPhase::Interact, ctx.actor(), 0);
        let destroyed = summary.disassemble && self.destroy(id);
        if !destroyed {
            self.persist_handle(&handle);
        }
        InteractOutcome::Interacted {
            instance: id,
            summary,
            destroyed,
        }
    }

    /// A cell was broken. If it belongs to an instance, listeners may veto;
    /// otherwise on-break actions run and the instance is destroyed.
    pub fn on_cell_broken(&self, pos: CellPos, actor: Option<&ActorId>) -> BreakOutcome {
        let Some(handle) = self.registry.instance_at(pos) else {
            return BreakOutcome::NotMultiblock;
        };

        let mut event = {
            let instance = handle.read().expect("instance lock poisoned");
            PreDestroyEvent {
                instance: instance.id(),
                template_id: instance.template_id().to_string(),
                anchor: instance.anchor(),
                broken: pos,
                actor: actor.cloned(),
                cancelled: false,
            }
        };
        let listeners = self
            .break_listeners
            .read()
            .expect("listener lock poisoned")
            .clone();
        for listener in listeners {
            listener.pre_destroy(&mut event);
        }
        if event.is_cancelled() {
            tracing::debug!(instance = %event.instance, cell = %pos, "destruction vetoed");
            return BreakOutcome::Vetoed(event.instance);
        }

        self.registry.run_phase(&handle, ActionPhase::Break, actor, 0);
        self.destroy(event.instance);
        BreakOutcome::Destroyed(event.instance)
    }

    /// Advance one tick. Ticked instances queue a fresh snapshot; instances
    /// that disassembled lose their records.
    pub fn tick(&self, tick: u64) -> TickSummary {
        let summary = self.registry.tick(tick);
        for handle in &summary.updated {
            let id = handle.read().expect("instance lock poisoned").id();
            // Skip instances broken by another thread since the pass.
            if self.registry.get(id).is_some() {
                self.persist_handle(handle);
            }
        }
        for handle in &summary.destroyed {
            self.forget(&handle.read().expect("instance lock poisoned"));
        }
        summary
    }

    /// Destroy an instance and delete its record. Returns whether it existed.
    pub fn destroy(&self, id: InstanceId) -> bool {
        match self.registry.destroy_instance(id) {
            Some(handle) => {
                self.forget(&handle.read().expect("instance lock poisoned"));
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Queue a snapshot of every persistent instance. Returns how many
    /// were written.
    pub fn persist_instances(&self) -> StorageResult<usize> {
        let mut written = 0;
        for handle in self.registry.snapshot() {
            let instance = handle.read().expect("instance lock poisoned");
            if self.write_snapshot(&instance)? {
                written += 1;
            }
        }
        Ok(written)
    }

    /// Re-admit saved instances. Snapshots whose template is unknown or
    /// whose cells are already claimed are skipped.
    pub fn restore_instances(&self) -> StorageResult<usize> {
        let mut restored = 0;
        for record in self.instances.read_all()? {
            let snapshot: InstanceSnapshot = match serde_json::from_slice(&record.payload) {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(key = %record.key, error = %e, "unreadable instance snapshot skipped");
                    continue;
                }
            };
            let Some(template) = self.registry.get_type(&snapshot.template_id) else {
                tracing::warn!(
                    key = %record.key,
                    template = %snapshot.template_id,
                    "instance of unknown template skipped"
                );
                continue;
            };
            if template.version() != snapshot.template_version {
                tracing::warn!(
                    template = %template.id(),
                    saved = snapshot.template_version,
                    current = template.version(),
                    "restoring instance saved with another template version"
                );
            }
            let instance = MultiblockInstance::from_snapshot(self.registry.allocate_id(), template, snapshot);
            match self.registry.register_instance(instance, true) {
                Ok(_) => restored += 1,
                Err(e) => tracing::warn!(key = %record.key, error = %e, "instance restore skipped"),
            }
        }
        tracing::info!(restored, "instances restored");
        Ok(restored)
    }

    /// Flush queued writes now.
    pub fn flush(&self) -> FlushReport {
        self.storage.flush()
    }

    /// Stop the engine. A graceful shutdown snapshots every persistent
    /// instance first.
    pub fn shutdown(&self, graceful: bool) -> FlushReport {
        if graceful {
            if let Err(e) = self.persist_instances() {
                tracing::warn!(error = %e, "failed to snapshot instances at shutdown");
            }
        }
        let report = self.storage.shutdown(graceful);
        tracing::info!(
            graceful,
            instances = self.registry.len(),
            written = report.written,
            dropped = report.dropped,
            "multiblock engine shut down"
        );
        report
    }

    fn persist_report(&self, report: &AssemblyReport) {
        if let Some(handle) = report.instance.and_then(|id| self.registry.get(id)) {
            self.persist_handle(&handle);
        }
    }

    fn persist_handle(&self, handle: &InstanceHandle) {
        let instance = handle.read().expect("instance lock poisoned");
        if let Err(e) = self.write_snapshot(&instance) {
            tracing::warn!(instance = %instance.id(), error = %e, "instance snapshot not saved");
        }
    }

    fn write_snapshot(&self, instance: &MultiblockInstance) -> StorageResult<bool> {
        if !instance.persistent() {
            return Ok(false);
        }
        let payload = serde_json::to_vec(&instance.snapshot()).map_err(|e| StorageError::Serialization {
            message: format!("instance snapshot encode failed: {e}"),
        })?;
        self.instances
            .write(&instance.anchor().storage_key(), payload, WriteMeta::default())?;
        Ok(true)
    }

    fn forget(&self, instance: &MultiblockInstance) {
        if !instance.persistent() {
            return;
        }
        if let Err(e) = self
            .instances
            .delete(&instance.anchor().storage_key(), WriteMeta::default())
        {
            tracing::warn!(instance = %instance.id(), error = %e, "instance record not deleted");
        }
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &AssemblyCoordinator {
        &self.coordinator
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    pub fn storage(&self) -> &StorageService {
        &self.storage
    }

    /// Report of the recovery pass run at startup.
    pub fn recovery_report(&self) -> &RecoveryReport {
        &self.recovery
    }

    pub fn last_report(&self, actor: &ActorId) -> Option<AssemblyReport> {
        self.coordinator.last_report(actor)
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("persistent", &self.config.data_dir.is_some())
            .field("templates", &self.registry.types().len())
            .field("instances", &self.registry.len())
            .field("storage", &self.storage)
            .finish()
    }
}
