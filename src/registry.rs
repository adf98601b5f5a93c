//! Instance registry: templates by id, instances by id, and the cell index.
//!
//! The [`InstanceRegistry`] maps every reserved world cell to the instance
//! that owns it using a `DashMap`, so background readers (a periodic flush
//! serializing instances, a debug overlay) can look cells up while the step
//! loop runs. All writes go through a single writer lock, which is what makes
//! reservation all-or-nothing: the conflict check and the inserts happen
//! under the same guard.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dashmap::DashMap;

use crate::behavior::{
    ActionContext, ActionPhase, ActionRegistry, ActionSummary, panic_message, run_actions,
};
use crate::capability::CapabilityFactory;
use crate::error::{RegistryError, RegistryResult, TemplateError, TemplateResult};
use crate::geom::{CellPos, Facing};
use crate::instance::{InstanceId, InstanceState, MultiblockInstance};
use crate::template::{MultiblockTemplate, TemplateSource};
use crate::trigger::ActorId;

/// Shared handle to a live instance.
pub type InstanceHandle = Arc<RwLock<MultiblockInstance>>;

/// Outcome of one registry tick.
#[derive(Debug, Default)]
pub struct TickSummary {
    /// Instances whose on-tick actions ran.
    pub ticked: usize,
    pub failed_actions: usize,
    /// Surviving instances that ticked and may carry new state.
    pub updated: Vec<InstanceHandle>,
    /// Instances destroyed after the pass because an action asked for it.
    pub destroyed: Vec<InstanceHandle>,
}

/// Concurrency-safe registry of templates and live instances.
pub struct InstanceRegistry {
    types: RwLock<BTreeMap<String, Arc<MultiblockTemplate>>>,
    /// Cell → owning instance. Every reserved cell appears exactly once.
    cells: DashMap<CellPos, InstanceId>,
    instances: DashMap<InstanceId, InstanceHandle>,
    factories: RwLock<BTreeMap<String, CapabilityFactory>>,
    actions: Arc<ActionRegistry>,
    next_id: AtomicU64,
    writer: Mutex<()>,
}

impl InstanceRegistry {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self {
            types: RwLock::new(BTreeMap::new()),
            cells: DashMap::new(),
            instances: DashMap::new(),
            factories: RwLock::new(BTreeMap::new()),
            actions,
            next_id: AtomicU64::new(1),
            writer: Mutex::new(()),
        }
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    /// Register a template, resolving id conflicts by source.
    ///
    /// Built-in definitions win over user definitions regardless of load
    /// order; two definitions from the same source are an error. Returns the
    /// template that ends up registered under the id.
    pub fn register_type(&self, template: MultiblockTemplate) -> TemplateResult<Arc<MultiblockTemplate>> {
        let mut types = self.types.write().expect("template lock poisoned");
        let id = template.id().to_string();

        if let Some(existing) = types.get(&id) {
            match (existing.source(), template.source()) {
                (TemplateSource::BuiltIn, TemplateSource::User) => {
                    tracing::warn!(template = %id, "user template shadowed by built-in, ignoring");
                    return Ok(Arc::clone(existing));
                }
                (TemplateSource::User, TemplateSource::BuiltIn) => {
                    tracing::warn!(template = %id, "built-in template replaces user definition");
                }
                _ => return Err(TemplateError::DuplicateTemplate { id }),
            }
        }

        let template = Arc::new(template);
        types.insert(id, Arc::clone(&template));
        Ok(template)
    }

    pub fn get_type(&self, id: &str) -> Option<Arc<MultiblockTemplate>> {
        self.types
            .read()
            .expect("template lock poisoned")
            .get(id)
            .cloned()
    }

    /// All templates, sorted by id.
    pub fn types(&self) -> Vec<Arc<MultiblockTemplate>> {
        self.types
            .read()
            .expect("template lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Register a capability factory under an owner id, replacing any
    /// previous factory from the same owner.
    pub fn register_capability_factory(&self, owner: impl Into<String>, factory: CapabilityFactory) {
        self.factories
            .write()
            .expect("factory lock poisoned")
            .insert(owner.into(), factory);
    }

    // -----------------------------------------------------------------------
    // Instances
    // -----------------------------------------------------------------------

    pub fn allocate_id(&self) -> InstanceId {
        InstanceId::new(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create and admit an instance of `template` anchored at `controller`.
    ///
    /// Returns `None` when any cell of the footprint is already claimed; in
    /// that case nothing is reserved.
    pub fn try_create(
        &self,
        controller: CellPos,
        template: &Arc<MultiblockTemplate>,
        facing: Facing,
        actor: Option<&ActorId>,
    ) -> Option<InstanceHandle> {
        let _guard = self.writer.lock().expect("registry writer lock poisoned");

        let footprint = template.footprint(controller, facing);
        if let Some((pos, owner)) = self.first_conflict(&footprint) {
            tracing::debug!(
                template = %template.id(),
                cell = %pos,
                owner = %owner,
                "creation rejected: cell already reserved"
            );
            return None;
        }

        let mut instance =
            MultiblockInstance::new(self.allocate_id(), Arc::clone(template), controller, facing);
        instance.set_owner(actor.cloned());
        self.attach_capabilities(&mut instance);

        let summary = {
            let mut ctx = ActionContext {
                instance: &mut instance,
                phase: ActionPhase::Create,
                actor,
                tick: 0,
            };
            run_actions(&self.actions, template.actions(ActionPhase::Create), &mut ctx)
        };
        if summary.disassemble {
            tracing::debug!(template = %template.id(), "disassemble ignored during on_create");
        }

        Some(self.admit(instance))
    }

    /// Admit an already-built instance (for example one restored from
    /// storage), reserving exactly its recorded cells.
    pub fn register_instance(
        &self,
        mut instance: MultiblockInstance,
        persist: bool,
    ) -> RegistryResult<InstanceHandle> {
        let _guard = self.writer.lock().expect("registry writer lock poisoned");

        if let Some((pos, owner)) = self.first_conflict(instance.reserved()) {
            return Err(RegistryError::CellClaimed {
                position: pos.to_string(),
                owner: owner.get(),
            });
        }
        instance.set_persistent(persist && instance.template().persistent());
        if instance.capabilities().is_empty() {
            self.attach_capabilities(&mut instance);
        }
        Ok(self.admit(instance))
    }

    /// Remove an instance and release the cells it reserved at creation.
    pub fn destroy_instance(&self, id: InstanceId) -> Option<InstanceHandle> {
        let _guard = self.writer.lock().expect("registry writer lock poisoned");
        let (_, handle) = self.instances.remove(&id)?;
        {
            let instance = handle.read().expect("instance lock poisoned");
            for pos in instance.reserved() {
                self.cells.remove_if(pos, |_, owner| *owner == id);
            }
            tracing::debug!(
                instance = %id,
                template = %instance.template_id(),
                anchor = %instance.anchor(),
                "multiblock destroyed"
            );
        }
        Some(handle)
    }

    /// The instance occupying `pos`, if any.
    pub fn instance_at(&self, pos: CellPos) -> Option<InstanceHandle> {
        let id = *self.cells.get(&pos)?;
        self.get(id)
    }

    pub fn get(&self, id: InstanceId) -> Option<InstanceHandle> {
        self.instances.get(&id).map(|r| Arc::clone(r.value()))
    }

    pub fn is_reserved(&self, pos: CellPos) -> bool {
        self.cells.contains_key(&pos)
    }

    /// Point-in-time list of live instances, ordered by id.
    pub fn snapshot(&self) -> Vec<InstanceHandle> {
        let mut entries: Vec<(InstanceId, InstanceHandle)> = self
            .instances
            .iter()
            .map(|r| (*r.key(), Arc::clone(r.value())))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries.into_iter().map(|(_, h)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Number of reserved cells across all instances.
    pub fn reserved_cells(&self) -> usize {
        self.cells.len()
    }

    /// Run one phase's actions on an instance.
    pub fn run_phase(
        &self,
        handle: &InstanceHandle,
        phase: ActionPhase,
        actor: Option<&ActorId>,
        tick: u64,
    ) -> ActionSummary {
        let mut instance = handle.write().expect("instance lock poisoned");
        let template = Arc::clone(instance.template());
        let mut ctx = ActionContext {
            instance: &mut instance,
            phase,
            actor,
            tick,
        };
        run_actions(&self.actions, template.actions(phase), &mut ctx)
    }

    /// Tick every due instance.
    ///
    /// Iterates a snapshot, so the registry itself is never mutated mid-pass;
    /// instances that ask to be disassembled are destroyed after the pass.
    pub fn tick(&self, tick: u64) -> TickSummary {
        let mut summary = TickSummary::default();
        let mut doomed = Vec::new();

        for handle in self.snapshot() {
            let (id, due) = {
                let instance = handle.read().expect("instance lock poisoned");
                let interval = u64::from(instance.template().tick_interval().max(1));
                (
                    instance.id(),
                    instance.state() == InstanceState::Active && tick % interval == 0,
                )
            };
            if !due {
                continue;
            }

            let result = self.run_phase(&handle, ActionPhase::Tick, None, tick);
            {
                let mut instance = handle.write().expect("instance lock poisoned");
                if let Err(payload) =
                    panic::catch_unwind(AssertUnwindSafe(|| instance.tick_capabilities()))
                {
                    summary.failed_actions += 1;
                    tracing::warn!(
                        template = %instance.template_id(),
                        instance = %id,
                        error = %panic_message(payload.as_ref()),
                        "capability tick panicked, continuing"
                    );
                }
            }

            summary.ticked += 1;
            summary.failed_actions += result.failed;
            if result.disassemble {
                doomed.push(id);
            } else {
                summary.updated.push(handle);
            }
        }

        for id in doomed {
            if let Some(handle) = self.destroy_instance(id) {
                summary.destroyed.push(handle);
            }
        }
        summary
    }

    fn first_conflict(&self, cells: &[CellPos]) -> Option<(CellPos, InstanceId)> {
        cells
            .iter()
            .find_map(|pos| self.cells.get(pos).map(|owner| (*pos, *owner)))
    }

    /// Insert an instance and its cells. Caller holds the writer lock and
    /// has checked for conflicts.
    fn admit(&self, instance: MultiblockInstance) -> InstanceHandle {
        let id = instance.id();
        let cells = instance.reserved().to_vec();
        tracing::debug!(
            instance = %id,
            template = %instance.template_id(),
            anchor = %instance.anchor(),
            facing = %instance.facing(),
            cells = cells.len(),
            "multiblock registered"
        );
        let handle = Arc::new(RwLock::new(instance));
        self.instances.insert(id, Arc::clone(&handle));
        for pos in cells {
            self.cells.insert(pos, id);
        }
        handle
    }

    fn attach_capabilities(&self, instance: &mut MultiblockInstance) {
        let factories: Vec<(String, CapabilityFactory)> = self
            .factories
            .read()
            .expect("factory lock poisoned")
            .iter()
            .map(|(owner, f)| (owner.clone(), Arc::clone(f)))
            .collect();

        for (owner, factory) in factories {
            for capability in factory(instance) {
                let id = instance.id().get();
                if let Err(e) = instance.capabilities_mut().attach(id, capability) {
                    tracing::warn!(owner = %owner, error = %e, "capability attach rejected");
                }
            }
        }
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("types", &self.types.read().map(|t| t.len()).unwrap_or(0))
            .field("instances", &self.len())
            .field("cells", &self.reserved_cells())
            .finish()
    }
}
