//! Template actions: what an instance does on create, tick, interact, break.
//!
//! Actions are declarative ([`ActionSpec`]) with one escape hatch,
//! [`ActionSpec::Invoke`], which calls a host-registered [`ActionHandler`].
//! Each action runs in isolation: a failure or panic is logged with the owning
//! template and instance and the remaining actions still run.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::instance::{InstanceState, MultiblockInstance};
use crate::trigger::ActorId;

/// When an action list runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionPhase {
    Create,
    Tick,
    Interact,
    Break,
}

impl fmt::Display for ActionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "on_create"),
            Self::Tick => write!(f, "on_tick"),
            Self::Interact => write!(f, "on_interact"),
            Self::Break => write!(f, "on_break"),
        }
    }
}

/// One declarative action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionSpec {
    /// Set a variable to a literal value.
    Set {
        key: String,
        value: serde_json::Value,
    },
    /// Add `by` to a numeric variable (absent counts as zero).
    Increment {
        key: String,
        #[serde(default = "default_increment")]
        by: f64,
    },
    /// Move the instance to another lifecycle state.
    State { state: InstanceState },
    /// Queue the instance for destruction once the current pass finishes.
    Disassemble,
    /// Call a host handler by name.
    Invoke {
        handler: String,
        #[serde(default)]
        args: BTreeMap<String, String>,
    },
}

fn default_increment() -> f64 {
    1.0
}

/// The four per-phase action lists of a template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionLists {
    #[serde(default)]
    pub on_create: Vec<ActionSpec>,
    #[serde(default)]
    pub on_tick: Vec<ActionSpec>,
    #[serde(default)]
    pub on_interact: Vec<ActionSpec>,
    #[serde(default)]
    pub on_break: Vec<ActionSpec>,
}

impl ActionLists {
    pub fn get(&self, phase: ActionPhase) -> &[ActionSpec] {
        match phase {
            ActionPhase::Create => &self.on_create,
            ActionPhase::Tick => &self.on_tick,
            ActionPhase::Interact => &self.on_interact,
            ActionPhase::Break => &self.on_break,
        }
    }

    pub fn push(&mut self, phase: ActionPhase, action: ActionSpec) {
        match phase {
            ActionPhase::Create => self.on_create.push(action),
            ActionPhase::Tick => self.on_tick.push(action),
            ActionPhase::Interact => self.on_interact.push(action),
            ActionPhase::Break => self.on_break.push(action),
        }
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("no action handler named \"{name}\"")]
    #[diagnostic(
        code(multiblock::action::unknown_handler),
        help("Register the handler with `ActionRegistry::register` before loading templates that use it.")
    )]
    UnknownHandler { name: String },

    #[error("variable \"{key}\" is not numeric")]
    #[diagnostic(code(multiblock::action::not_numeric))]
    NotNumeric { key: String },

    #[error("handler \"{name}\" failed: {message}")]
    #[diagnostic(code(multiblock::action::handler))]
    Handler { name: String, message: String },

    #[error("action panicked: {message}")]
    #[diagnostic(
        code(multiblock::action::panicked),
        help("The instance keeps running; fix the handler so it returns an error instead.")
    )]
    Panicked { message: String },
}

/// What an action sees while it runs.
pub struct ActionContext<'a> {
    pub instance: &'a mut MultiblockInstance,
    pub phase: ActionPhase,
    pub actor: Option<&'a ActorId>,
    pub tick: u64,
}

/// Host-provided behaviour invoked by [`ActionSpec::Invoke`].
pub trait ActionHandler: Send + Sync {
    fn call(
        &self,
        ctx: &mut ActionContext<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<(), ActionError>;
}

impl<F> ActionHandler for F
where
    F: Fn(&mut ActionContext<'_>, &BTreeMap<String, String>) -> Result<(), ActionError>
        + Send
        + Sync,
{
    fn call(
        &self,
        ctx: &mut ActionContext<'_>,
        args: &BTreeMap<String, String>,
    ) -> Result<(), ActionError> {
        self(ctx, args)
    }
}

/// Named host action handlers.
#[derive(Default)]
pub struct ActionRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn ActionHandler>>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one with the same name.
    pub fn register(&self, name: impl Into<String>, handler: Arc<dyn ActionHandler>) {
        let name = name.into();
        let mut handlers = self.handlers.write().expect("action lock poisoned");
        if handlers.insert(name.clone(), handler).is_some() {
            tracing::warn!(handler = %name, "action handler replaced");
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers
            .read()
            .expect("action lock poisoned")
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = self.handlers.read().map(|h| h.len()).unwrap_or(0);
        f.debug_struct("ActionRegistry").field("handlers", &count).finish()
    }
}

/// Tally of one action-list run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub executed: usize,
    pub failed: usize,
    pub disassemble: bool,
}

/// Run `actions` against the instance in `ctx`, isolating failures.
pub fn run_actions(
    registry: &ActionRegistry,
    actions: &[ActionSpec],
    ctx: &mut ActionContext<'_>,
) -> ActionSummary {
    let mut summary = ActionSummary::default();
    for (index, action) in actions.iter().enumerate() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| execute(registry, action, ctx)))
            .unwrap_or_else(|payload| {
                Err(ActionError::Panicked {
                    message: panic_message(payload.as_ref()),
                })
            });
        match outcome {
            Ok(disassemble) => {
                summary.executed += 1;
                summary.disassemble |= disassemble;
            }
            Err(e) => {
                summary.failed += 1;
                tracing::warn!(
                    template = %ctx.instance.template_id(),
                    instance = %ctx.instance.id(),
                    phase = %ctx.phase,
                    index,
                    error = %e,
                    "multiblock action failed, continuing"
                );
            }
        }
    }
    summary
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn execute(
    registry: &ActionRegistry,
    action: &ActionSpec,
    ctx: &mut ActionContext<'_>,
) -> Result<bool, ActionError> {
    match action {
        ActionSpec::Set { key, value } => {
            ctx.instance.set_variable(key.clone(), value.clone());
        }
        ActionSpec::Increment { key, by } => {
            let current = ctx
                .instance
                .variable(key)
                .cloned()
                .unwrap_or(serde_json::Value::from(0));
            let next = add_number(&current, *by).ok_or_else(|| ActionError::NotNumeric {
                key: key.clone(),
            })?;
            ctx.instance.set_variable(key.clone(), next);
        }
        ActionSpec::State { state } => ctx.instance.set_state(*state),
        ActionSpec::Disassemble => return Ok(true),
        ActionSpec::Invoke { handler, args } => {
            let h = registry
                .get(handler)
                .ok_or_else(|| ActionError::UnknownHandler {
                    name: handler.clone(),
                })?;
            h.call(ctx, args)?;
        }
    }
    Ok(false)
}

fn add_number(current: &serde_json::Value, by: f64) -> Option<serde_json::Value> {
    let n = current.as_number()?;
    if let (Some(i), true) = (n.as_i64(), by.fract() == 0.0) {
        return Some(serde_json::Value::from(i.checked_add(by as i64)?));
    }
    let sum = n.as_f64()? + by;
    serde_json::Number::from_f64(sum).map(serde_json::Value::Number)
}
