//! Capabilities attached to live instances.
//!
//! External code registers a [`CapabilityFactory`] under an owner id; the
//! registry invokes every factory once per newly created instance and
//! attaches what they return. An instance holds at most one capability of
//! each kind.

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CapabilityError;
use crate::instance::{MultiblockInstance, Variables};

/// Behaviour or storage bolted onto an instance (an energy buffer, an item
/// handler, ...).
pub trait Capability: Any + Send + Sync {
    /// Kind key; unique per instance.
    fn kind(&self) -> &str;

    /// Called on every tick the owning instance runs.
    fn tick(&mut self, _variables: &mut Variables) {}

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Produces capabilities for a freshly created instance.
pub type CapabilityFactory =
    Arc<dyn Fn(&MultiblockInstance) -> Vec<Box<dyn Capability>> + Send + Sync>;

/// Capabilities of one instance, keyed by kind.
#[derive(Default)]
pub struct CapabilitySet {
    by_kind: BTreeMap<String, Box<dyn Capability>>,
}

impl CapabilitySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a capability. A second capability of the same kind is rejected.
    pub fn attach(&mut self, instance: u64, capability: Box<dyn Capability>) -> Result<(), CapabilityError> {
        let kind = capability.kind().to_string();
        if self.by_kind.contains_key(&kind) {
            return Err(CapabilityError::Duplicate { kind, instance });
        }
        self.by_kind.insert(kind, capability);
        Ok(())
    }

    pub fn detach(&mut self, kind: &str) -> Option<Box<dyn Capability>> {
        self.by_kind.remove(kind)
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.by_kind.contains_key(kind)
    }

    /// Typed lookup by kind.
    pub fn get<T: Capability>(&self, kind: &str) -> Option<&T> {
        self.by_kind.get(kind)?.as_any().downcast_ref::<T>()
    }

    pub fn get_mut<T: Capability>(&mut self, kind: &str) -> Option<&mut T> {
        self.by_kind.get_mut(kind)?.as_any_mut().downcast_mut::<T>()
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.by_kind.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_kind.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_kind.is_empty()
    }

    pub(crate) fn tick_all(&mut self, variables: &mut Variables) {
        for capability in self.by_kind.values_mut() {
            capability.tick(variables);
        }
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.by_kind.keys()).finish()
    }
}
