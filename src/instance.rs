//! Live multiblock instances.
//!
//! An instance is created by the assembly coordinator when a template's
//! pattern matches, owned by the [`InstanceRegistry`](crate::registry::InstanceRegistry),
//! and mutated by actions and capabilities during ticks and interactions.
//!
//! The cells an instance reserves are captured at creation time so that
//! destruction releases exactly those cells, even if the template is
//! later redefined.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::capability::CapabilitySet;
use crate::geom::{CellPos, Facing};
use crate::template::MultiblockTemplate;
use crate::trigger::ActorId;

/// Mutable per-instance variables, seeded from template defaults.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Registry-assigned instance identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mb:{}", self.0)
    }
}

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    #[default]
    Active,
    Disabled,
}

/// A live structure in the world.
pub struct MultiblockInstance {
    id: InstanceId,
    template: Arc<MultiblockTemplate>,
    anchor: CellPos,
    facing: Facing,
    state: InstanceState,
    variables: Variables,
    capabilities: CapabilitySet,
    reserved: Arc<[CellPos]>,
    owner: Option<ActorId>,
    persistent: bool,
}

impl MultiblockInstance {
    pub fn new(
        id: InstanceId,
        template: Arc<MultiblockTemplate>,
        anchor: CellPos,
        facing: Facing,
    ) -> Self {
        let reserved = template.footprint(anchor, facing).into();
        Self {
            id,
            variables: template.default_variables().clone(),
            persistent: template.persistent(),
            template,
            anchor,
            facing,
            state: InstanceState::Active,
            capabilities: CapabilitySet::new(),
            reserved,
            owner: None,
        }
    }

    /// Rebuild an instance from a persisted snapshot.
    ///
    /// The snapshot's reserved cells are kept verbatim.
    pub fn from_snapshot(id: InstanceId, template: Arc<MultiblockTemplate>, snapshot: InstanceSnapshot) -> Self {
        Self {
            id,
            persistent: template.persistent(),
            template,
            anchor: snapshot.anchor,
            facing: snapshot.facing,
            state: snapshot.state,
            variables: snapshot.variables,
            capabilities: CapabilitySet::new(),
            reserved: snapshot.reserved.into(),
            owner: snapshot.owner,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn template(&self) -> &Arc<MultiblockTemplate> {
        &self.template
    }

    pub fn template_id(&self) -> &str {
        self.template.id()
    }

    pub fn anchor(&self) -> CellPos {
        self.anchor
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn set_state(&mut self, state: InstanceState) {
        self.state = state;
    }

    pub fn variables(&self) -> &Variables {
        &self.variables
    }

    pub fn variable(&self, key: &str) -> Option<&serde_json::Value> {
        self.variables.get(key)
    }

    pub fn set_variable(&mut self, key: String, value: serde_json::Value) {
        self.variables.insert(key, value);
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn capabilities_mut(&mut self) -> &mut CapabilitySet {
        &mut self.capabilities
    }

    /// Cells claimed for this instance at creation.
    pub fn reserved(&self) -> &[CellPos] {
        &self.reserved
    }

    pub fn owner(&self) -> Option<&ActorId> {
        self.owner.as_ref()
    }

    pub fn set_owner(&mut self, owner: Option<ActorId>) {
        self.owner = owner;
    }

    /// Whether the storage layer should record this instance.
    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn set_persistent(&mut self, persistent: bool) {
        self.persistent = persistent;
    }

    pub(crate) fn tick_capabilities(&mut self) {
        self.capabilities.tick_all(&mut self.variables);
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        InstanceSnapshot {
            template_id: self.template.id().to_string(),
            template_version: self.template.version(),
            anchor: self.anchor,
            facing: self.facing,
            state: self.state,
            variables: self.variables.clone(),
            reserved: self.reserved.to_vec(),
            owner: self.owner.clone(),
        }
    }
}

impl fmt::Debug for MultiblockInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MultiblockInstance")
            .field("id", &self.id)
            .field("template", &self.template.id())
            .field("anchor", &self.anchor)
            .field("facing", &self.facing)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

/// Serializable form of an instance, stored as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub template_id: String,
    pub template_version: u32,
    pub anchor: CellPos,
    pub facing: Facing,
    pub state: InstanceState,
    pub variables: Variables,
    pub reserved: Vec<CellPos>,
    #[serde(default)]
    pub owner: Option<ActorId>,
}
