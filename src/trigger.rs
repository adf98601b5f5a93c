//! Assembly triggers: named predicates over an interaction.
//!
//! A template names the trigger that must fire before the engine even looks
//! at its pattern. Triggers live in a [`TriggerRegistry`] under
//! `namespace:key` ids; four built-ins cover the common host events.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{TriggerError, TriggerResult};
use crate::geom::CellPos;

pub const WRENCH_USE: &str = "core:wrench_use";
pub const SNEAK_RIGHT_CLICK: &str = "core:sneak_right_click";
pub const ON_FINAL_BLOCK_PLACED: &str = "core:on_final_block_placed";
pub const MANUAL_ONLY: &str = "core:manual_only";

/// Validated `namespace:key` identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TriggerId(String);

impl TriggerId {
    pub fn parse(raw: &str) -> TriggerResult<Self> {
        let id = raw.trim();
        let invalid = || TriggerError::InvalidId { id: raw.to_string() };
        let (namespace, key) = id.split_once(':').ok_or_else(invalid)?;
        if namespace.trim().is_empty() || key.trim().is_empty() || key.contains(':') {
            return Err(invalid());
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn namespace(&self) -> &str {
        self.0.split_once(':').map(|(ns, _)| ns).unwrap_or_default()
    }
}

impl TryFrom<String> for TriggerId {
    type Error = TriggerError;

    fn try_from(raw: String) -> Result<Self, Self::Error> {
        Self::parse(&raw)
    }
}

impl From<TriggerId> for String {
    fn from(id: TriggerId) -> Self {
        id.0
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Host identity of a player or other actor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId(pub String);

impl ActorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Why an assembly attempt was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyCause {
    Manual,
    ActorInteract,
    CellPlaced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    RightClickCell,
    LeftClickCell,
    RightClickAir,
    LeftClickAir,
    Physical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Hand {
    Main,
    Off,
}

/// Everything a trigger may inspect about one attempt.
///
/// Built through the constructors and `with_*` methods, then read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct AssemblyContext {
    cause: AssemblyCause,
    actor: Option<ActorId>,
    target: Option<CellPos>,
    interaction: Option<InteractionKind>,
    held_item: Option<String>,
    hand: Option<Hand>,
    sneaking: bool,
    attributes: BTreeMap<String, serde_json::Value>,
}

impl AssemblyContext {
    pub fn new(cause: AssemblyCause) -> Self {
        Self {
            cause,
            actor: None,
            target: None,
            interaction: None,
            held_item: None,
            hand: None,
            sneaking: false,
            attributes: BTreeMap::new(),
        }
    }

    pub fn manual() -> Self {
        Self::new(AssemblyCause::Manual)
    }

    pub fn interact(actor: ActorId, interaction: InteractionKind) -> Self {
        Self::new(AssemblyCause::ActorInteract)
            .with_actor(actor)
            .with_interaction(interaction)
    }

    pub fn placed(target: CellPos) -> Self {
        Self::new(AssemblyCause::CellPlaced).with_target(target)
    }

    pub fn with_actor(mut self, actor: ActorId) -> Self {
        self.actor = Some(actor);
        self
    }

    pub fn with_target(mut self, target: CellPos) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_interaction(mut self, interaction: InteractionKind) -> Self {
        self.interaction = Some(interaction);
        self
    }

    pub fn with_held_item(mut self, item: impl Into<String>) -> Self {
        self.held_item = Some(item.into());
        self
    }

    pub fn with_hand(mut self, hand: Hand) -> Self {
        self.hand = Some(hand);
        self
    }

    pub fn with_sneaking(mut self, sneaking: bool) -> Self {
        self.sneaking = sneaking;
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Replace the attribute map; a missing map normalizes to empty.
    pub fn with_attributes(mut self, attributes: Option<BTreeMap<String, serde_json::Value>>) -> Self {
        self.attributes = attributes.unwrap_or_default();
        self
    }

    pub fn cause(&self) -> AssemblyCause {
        self.cause
    }

    pub fn actor(&self) -> Option<&ActorId> {
        self.actor.as_ref()
    }

    pub fn target(&self) -> Option<CellPos> {
        self.target
    }

    pub fn interaction(&self) -> Option<InteractionKind> {
        self.interaction
    }

    pub fn held_item(&self) -> Option<&str> {
        self.held_item.as_deref()
    }

    pub fn hand(&self) -> Option<Hand> {
        self.hand
    }

    pub fn sneaking(&self) -> bool {
        self.sneaking
    }

    pub fn attributes(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.attributes
    }

    /// True when the attribute is boolean `true` or the string `"true"`.
    pub fn flag(&self, key: &str) -> bool {
        match self.attributes.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::String(s)) => s.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    fn is_right_click_on_cell(&self) -> bool {
        self.cause == AssemblyCause::ActorInteract
            && self.interaction == Some(InteractionKind::RightClickCell)
    }
}

// ---------------------------------------------------------------------------
// Triggers
// ---------------------------------------------------------------------------

/// A named predicate deciding whether an attempt should proceed.
pub trait AssemblyTrigger: Send + Sync {
    fn id(&self) -> &TriggerId;
    fn fires(&self, ctx: &AssemblyContext) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuiltinKind {
    WrenchUse,
    SneakRightClick,
    FinalBlockPlaced,
    ManualOnly,
}

/// One of the four triggers every registry starts with.
#[derive(Debug, Clone)]
pub struct BuiltinTrigger {
    id: TriggerId,
    kind: BuiltinKind,
}

impl BuiltinTrigger {
    pub fn all() -> Vec<BuiltinTrigger> {
        [
            (WRENCH_USE, BuiltinKind::WrenchUse),
            (SNEAK_RIGHT_CLICK, BuiltinKind::SneakRightClick),
            (ON_FINAL_BLOCK_PLACED, BuiltinKind::FinalBlockPlaced),
            (MANUAL_ONLY, BuiltinKind::ManualOnly),
        ]
        .into_iter()
        .map(|(id, kind)| BuiltinTrigger {
            id: TriggerId(id.to_string()),
            kind,
        })
        .collect()
    }
}

impl AssemblyTrigger for BuiltinTrigger {
    fn id(&self) -> &TriggerId {
        &self.id
    }

    fn fires(&self, ctx: &AssemblyContext) -> bool {
        match self.kind {
            BuiltinKind::WrenchUse => ctx.is_right_click_on_cell() && ctx.flag("wrench"),
            BuiltinKind::SneakRightClick => ctx.is_right_click_on_cell() && ctx.sneaking(),
            BuiltinKind::FinalBlockPlaced => ctx.cause() == AssemblyCause::CellPlaced,
            BuiltinKind::ManualOnly => ctx.cause() == AssemblyCause::Manual,
        }
    }
}

/// Trigger defined by a closure, for host-specific conditions.
pub struct FnTrigger<F> {
    id: TriggerId,
    predicate: F,
}

impl<F> FnTrigger<F>
where
    F: Fn(&AssemblyContext) -> bool + Send + Sync,
{
    pub fn new(id: &str, predicate: F) -> TriggerResult<Self> {
        Ok(Self {
            id: TriggerId::parse(id)?,
            predicate,
        })
    }
}

impl<F> AssemblyTrigger for FnTrigger<F>
where
    F: Fn(&AssemblyContext) -> bool + Send + Sync,
{
    fn id(&self) -> &TriggerId {
        &self.id
    }

    fn fires(&self, ctx: &AssemblyContext) -> bool {
        (self.predicate)(ctx)
    }
}

/// Namespaced trigger lookup.
pub struct TriggerRegistry {
    triggers: RwLock<BTreeMap<TriggerId, Arc<dyn AssemblyTrigger>>>,
}

impl TriggerRegistry {
    /// A registry holding only the built-in triggers.
    pub fn new() -> Self {
        let triggers = BuiltinTrigger::all()
            .into_iter()
            .map(|t| (t.id.clone(), Arc::new(t) as Arc<dyn AssemblyTrigger>))
            .collect();
        Self {
            triggers: RwLock::new(triggers),
        }
    }

    /// Register a trigger. Errors if its id is taken.
    pub fn register(&self, trigger: Arc<dyn AssemblyTrigger>) -> TriggerResult<()> {
        let mut triggers = self.triggers.write().expect("trigger lock poisoned");
        let id = trigger.id().clone();
        if triggers.contains_key(&id) {
            return Err(TriggerError::Duplicate { id: id.to_string() });
        }
        tracing::debug!(trigger = %id, "registered assembly trigger");
        triggers.insert(id, trigger);
        Ok(())
    }

    /// Look up a trigger. Malformed ids simply resolve to `None`.
    pub fn get(&self, id: &str) -> Option<Arc<dyn AssemblyTrigger>> {
        let id = TriggerId::parse(id).ok()?;
        self.triggers
            .read()
            .expect("trigger lock poisoned")
            .get(&id)
            .cloned()
    }

    /// All triggers, ordered by id.
    pub fn all(&self) -> Vec<Arc<dyn AssemblyTrigger>> {
        self.triggers
            .read()
            .expect("trigger lock poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.triggers.read().expect("trigger lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for TriggerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("count", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player() -> ActorId {
        ActorId::new("player-1")
    }

    #[test]
    fn trigger_id_validation() {
        assert!(TriggerId::parse("core:wrench_use").is_ok());
        assert_eq!(TriggerId::parse(" acme:x ").unwrap().as_str(), "acme:x");
        for bad in ["", "   ", "nocolon", "core:", ":key", "a:b:c"] {
            assert!(TriggerId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn wrench_use_requires_right_click_and_wrench() {
        let registry = TriggerRegistry::new();
        let wrench = registry.get(WRENCH_USE).unwrap();

        let ctx = AssemblyContext::interact(player(), InteractionKind::RightClickCell)
            .with_attribute("wrench", true);
        assert!(wrench.fires(&ctx));

        let no_wrench = AssemblyContext::interact(player(), InteractionKind::RightClickCell);
        assert!(!wrench.fires(&no_wrench));

        let left = AssemblyContext::interact(player(), InteractionKind::LeftClickCell)
            .with_attribute("wrench", true);
        assert!(!wrench.fires(&left));
    }

    #[test]
    fn sneak_right_click_requires_sneaking() {
        let registry = TriggerRegistry::new();
        let sneak = registry.get(SNEAK_RIGHT_CLICK).unwrap();
        let ctx = AssemblyContext::interact(player(), InteractionKind::RightClickCell);
        assert!(!sneak.fires(&ctx));
        assert!(sneak.fires(&ctx.with_sneaking(true)));
    }

    #[test]
    fn cause_based_builtins() {
        let registry = TriggerRegistry::new();
        let placed = registry.get(ON_FINAL_BLOCK_PLACED).unwrap();
        let manual = registry.get(MANUAL_ONLY).unwrap();
        let pos = CellPos::new(crate::geom::WorldId(0), 0, 0, 0);

        assert!(placed.fires(&AssemblyContext::placed(pos)));
        assert!(!placed.fires(&AssemblyContext::manual()));
        assert!(manual.fires(&AssemblyContext::manual()));
        assert!(!manual.fires(&AssemblyContext::placed(pos)));
    }

    #[test]
    fn custom_triggers_register_once() {
        let registry = TriggerRegistry::new();
        let t = FnTrigger::new("acme:held_hammer", |ctx| ctx.held_item() == Some("hammer")).unwrap();
        registry.register(Arc::new(t)).unwrap();
        assert_eq!(registry.len(), 5);

        let again = FnTrigger::new("acme:held_hammer", |_| true).unwrap();
        assert!(matches!(
            registry.register(Arc::new(again)),
            Err(TriggerError::Duplicate { .. })
        ));

        let hammer = registry.get("acme:held_hammer").unwrap();
        assert!(hammer.fires(&AssemblyContext::manual().with_held_item("hammer")));
    }

    #[test]
    fn unknown_and_malformed_ids_resolve_to_none() {
        let registry = TriggerRegistry::new();
        assert!(registry.get("core:does_not_exist").is_none());
        assert!(registry.get("garbage").is_none());
    }

    #[test]
    fn missing_attributes_normalize_to_empty() {
        let ctx = AssemblyContext::manual().with_attributes(None);
        assert!(ctx.attributes().is_empty());
        assert!(!ctx.flag("wrench"));
        let ctx = ctx.with_attribute("wrench", "TRUE");
        assert!(ctx.flag("wrench"));
    }

    #[test]
    fn all_is_sorted_by_id() {
        let registry = TriggerRegistry::new();
        let ids: Vec<String> = registry.all().iter().map(|t| t.id().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }
}
