//! Multiblock templates: the immutable blueprints instances are built from.
//!
//! A [`MultiblockTemplate`] is created once at load time, either through
//! [`TemplateBuilder`] or from a declarative [`TemplateDefinition`] (one TOML
//! file per template), and shared behind an `Arc` by the registry and every
//! instance built from it.
//!
//! Two legacy port shorthands are normalized into the port model on load:
//! a `[roles]` block (`input`/`output` offset lists, named `port_in_N` /
//! `port_out_N`) and `[inputs.<name>]` / `[outputs.<name>]` tables (named
//! `input_<name>` / `output_<name>`). Explicit `[ports]` entries win on a
//! name clash.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::behavior::{ActionLists, ActionPhase, ActionSpec};
use crate::error::{TemplateError, TemplateResult};
use crate::geom::{CellPos, Facing, Offset};
use crate::predicate::CellPredicate;
use crate::trigger;

/// Default number of ticks between on-tick runs.
pub const DEFAULT_TICK_INTERVAL: u32 = 20;

// ---------------------------------------------------------------------------
// Ports
// ---------------------------------------------------------------------------

/// Flow direction of a logical port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortDirection {
    #[serde(alias = "in")]
    Input,
    #[serde(alias = "out")]
    Output,
    #[serde(alias = "bidirectional")]
    Both,
}

impl PortDirection {
    /// Whether a port with this direction satisfies a filter for `wanted`.
    pub fn accepts(self, wanted: PortDirection) -> bool {
        self == wanted || self == PortDirection::Both
    }
}

impl fmt::Display for PortDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input => write!(f, "input"),
            Self::Output => write!(f, "output"),
            Self::Both => write!(f, "both"),
        }
    }
}

/// Which cell of a structure a port or action refers to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "BlockRefRepr", into = "BlockRefRepr")]
pub enum BlockRef {
    #[default]
    Controller,
    Offset(Offset),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum BlockRefRepr {
    Name(String),
    Array([i32; 3]),
    Table { dx: i32, dy: i32, dz: i32 },
}

impl TryFrom<BlockRefRepr> for BlockRef {
    type Error = String;

    fn try_from(repr: BlockRefRepr) -> Result<Self, Self::Error> {
        match repr {
            BlockRefRepr::Name(name) if name.trim().eq_ignore_ascii_case("controller") => {
                Ok(BlockRef::Controller)
            }
            BlockRefRepr::Name(name) => Err(format!(
                "unknown block reference \"{name}\" (expected \"controller\" or an offset)"
            )),
            BlockRefRepr::Array(a) => Ok(BlockRef::Offset(a.into())),
            BlockRefRepr::Table { dx, dy, dz } => Ok(BlockRef::Offset(Offset::new(dx, dy, dz))),
        }
    }
}

impl From<BlockRef> for BlockRefRepr {
    fn from(r: BlockRef) -> Self {
        match r {
            BlockRef::Controller => BlockRefRepr::Name("controller".into()),
            BlockRef::Offset(o) => BlockRefRepr::Array([o.dx, o.dy, o.dz]),
        }
    }
}

/// A declared logical connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDefinition {
    pub direction: PortDirection,
    /// Resource type carried by the port (`item`, `energy`, `fluid`, ...).
    #[serde(rename = "type", default = "default_port_type")]
    pub port_type: String,
    #[serde(default)]
    pub block: BlockRef,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl PortDefinition {
    pub fn new(direction: PortDirection, port_type: impl Into<String>, block: BlockRef) -> Self {
        Self {
            direction,
            port_type: port_type.into(),
            block,
            capabilities: BTreeSet::new(),
        }
    }

    pub fn with_capability(mut self, tag: impl Into<String>) -> Self {
        self.capabilities.insert(tag.into());
        self
    }
}

fn default_port_type() -> String {
    "generic".into()
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// One cell requirement relative to the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternEntry {
    pub offset: Offset,
    pub predicate: CellPredicate,
    pub optional: bool,
}

/// Where a template definition came from. Built-ins win id conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TemplateSource {
    BuiltIn,
    User,
}

/// Immutable multiblock blueprint.
#[derive(Debug)]
pub struct MultiblockTemplate {
    id: String,
    version: u32,
    controller: CellPredicate,
    pattern: Arc<[PatternEntry]>,
    tick_interval: u32,
    default_variables: BTreeMap<String, serde_json::Value>,
    actions: ActionLists,
    trigger: String,
    ports: BTreeMap<String, PortDefinition>,
    persistent: bool,
    extensions: BTreeMap<String, serde_json::Value>,
    source: TemplateSource,
}

impl MultiblockTemplate {
    pub fn builder(id: impl Into<String>, controller: CellPredicate) -> TemplateBuilder {
        TemplateBuilder::new(id, controller)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Controller offset; always the zero vector.
    pub fn controller_offset(&self) -> Offset {
        Offset::ZERO
    }

    pub fn controller(&self) -> &CellPredicate {
        &self.controller
    }

    pub fn pattern(&self) -> &[PatternEntry] {
        &self.pattern
    }

    pub fn tick_interval(&self) -> u32 {
        self.tick_interval
    }

    pub fn default_variables(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.default_variables
    }

    pub fn actions(&self, phase: ActionPhase) -> &[ActionSpec] {
        self.actions.get(phase)
    }

    pub fn trigger(&self) -> &str {
        &self.trigger
    }

    pub fn ports(&self) -> &BTreeMap<String, PortDefinition> {
        &self.ports
    }

    pub fn persistent(&self) -> bool {
        self.persistent
    }

    pub fn extensions(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.extensions
    }

    pub fn source(&self) -> TemplateSource {
        self.source
    }

    /// Every world cell the structure occupies when anchored at `anchor`
    /// facing `facing`: the controller first, then each pattern entry in
    /// declaration order, optional entries included.
    pub fn footprint(&self, anchor: CellPos, facing: Facing) -> Vec<CellPos> {
        std::iter::once(anchor)
            .chain(self.pattern.iter().map(|e| anchor + facing.rotate(e.offset)))
            .collect()
    }
}

/// Incremental constructor with validation in [`build`](Self::build).
#[derive(Debug)]
pub struct TemplateBuilder {
    id: String,
    version: u32,
    controller: CellPredicate,
    pattern: Vec<PatternEntry>,
    tick_interval: u32,
    default_variables: BTreeMap<String, serde_json::Value>,
    actions: ActionLists,
    trigger: String,
    ports: BTreeMap<String, PortDefinition>,
    persistent: bool,
    extensions: BTreeMap<String, serde_json::Value>,
    source: TemplateSource,
}

impl TemplateBuilder {
    fn new(id: impl Into<String>, controller: CellPredicate) -> Self {
        Self {
            id: id.into(),
            version: 1,
            controller,
            pattern: Vec::new(),
            tick_interval: DEFAULT_TICK_INTERVAL,
            default_variables: BTreeMap::new(),
            actions: ActionLists::default(),
            trigger: trigger::WRENCH_USE.to_string(),
            ports: BTreeMap::new(),
            persistent: true,
            extensions: BTreeMap::new(),
            source: TemplateSource::User,
        }
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    pub fn entry(mut self, offset: impl Into<Offset>, predicate: CellPredicate) -> Self {
        self.pattern.push(PatternEntry {
            offset: offset.into(),
            predicate,
            optional: false,
        });
        self
    }

    pub fn optional_entry(mut self, offset: impl Into<Offset>, predicate: CellPredicate) -> Self {
        self.pattern.push(PatternEntry {
            offset: offset.into(),
            predicate,
            optional: true,
        });
        self
    }

    pub fn trigger(mut self, id: impl Into<String>) -> Self {
        self.trigger = id.into();
        self
    }

    pub fn tick_interval(mut self, ticks: u32) -> Self {
        self.tick_interval = ticks;
        self
    }

    pub fn variable(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.default_variables.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, id: impl Into<String>, port: PortDefinition) -> Self {
        self.ports.insert(id.into(), port);
        self
    }

    pub fn action(mut self, phase: ActionPhase, action: ActionSpec) -> Self {
        self.actions.push(phase, action);
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn extension(mut self, namespace: impl Into<String>, value: serde_json::Value) -> Self {
        self.extensions.insert(namespace.into(), value);
        self
    }

    pub fn source(mut self, source: TemplateSource) -> Self {
        self.source = source;
        self
    }

    pub fn build(self) -> TemplateResult<MultiblockTemplate> {
        let id = self.id.trim().to_string();
        if id.is_empty() || id.chars().any(char::is_whitespace) {
            return Err(TemplateError::InvalidId { id: self.id });
        }
        if self.tick_interval == 0 {
            return Err(TemplateError::InvalidTickInterval { id });
        }

        let mut seen = BTreeSet::new();
        for entry in &self.pattern {
            if entry.offset.is_zero() {
                return Err(TemplateError::ControllerOffset {
                    id,
                    offset: entry.offset.to_string(),
                });
            }
            if !seen.insert(entry.offset) {
                return Err(TemplateError::DuplicateOffset {
                    id,
                    offset: entry.offset.to_string(),
                });
            }
        }

        for (name, port) in &self.ports {
            if name.trim().is_empty() {
                return Err(TemplateError::InvalidPort {
                    id,
                    port: name.clone(),
                    message: "port id is blank".into(),
                });
            }
            if let BlockRef::Offset(o) = port.block {
                if !o.is_zero() && !seen.contains(&o) {
                    tracing::debug!(
                        template = %id,
                        port = %name,
                        offset = %o,
                        "port points outside the declared pattern"
                    );
                }
            }
        }

        Ok(MultiblockTemplate {
            id,
            version: self.version,
            controller: self.controller,
            pattern: self.pattern.into(),
            tick_interval: self.tick_interval,
            default_variables: self.default_variables,
            actions: self.actions,
            trigger: self.trigger.trim().to_string(),
            ports: self.ports,
            persistent: self.persistent,
            extensions: self.extensions,
            source: self.source,
        })
    }
}

// ---------------------------------------------------------------------------
// Declarative definitions
// ---------------------------------------------------------------------------

/// One `[[pattern]]` entry in a template file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternEntryDef {
    pub offset: [i32; 3],
    pub predicate: String,
    #[serde(default)]
    pub optional: bool,
}

/// Legacy `[roles]` block: bare offset lists per direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolesDef {
    #[serde(default)]
    pub input: Vec<[i32; 3]>,
    #[serde(default)]
    pub output: Vec<[i32; 3]>,
}

/// Legacy `[inputs.<name>]` / `[outputs.<name>]` entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyPortDef {
    #[serde(default)]
    pub block: BlockRef,
    #[serde(rename = "type", default = "default_port_type")]
    pub port_type: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

/// A template as written in a `.toml` file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateDefinition {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub controller: String,
    #[serde(default = "default_trigger")]
    pub trigger: String,
    /// Falls back to the engine's configured default when absent.
    #[serde(default)]
    pub tick_interval: Option<u32>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
    #[serde(default)]
    pub pattern: Vec<PatternEntryDef>,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub ports: BTreeMap<String, PortDefinition>,
    #[serde(default)]
    pub roles: Option<RolesDef>,
    #[serde(default)]
    pub inputs: BTreeMap<String, LegacyPortDef>,
    #[serde(default)]
    pub outputs: BTreeMap<String, LegacyPortDef>,
    #[serde(default)]
    pub actions: ActionLists,
    /// Forward-compatible metadata, kept verbatim per namespace.
    #[serde(default)]
    pub extensions: BTreeMap<String, serde_json::Value>,
}

fn default_version() -> u32 {
    1
}
fn default_trigger() -> String {
    trigger::WRENCH_USE.into()
}
fn default_persistent() -> bool {
    true
}

impl TemplateDefinition {
    /// Parse a single definition from TOML text.
    pub fn from_toml(text: &str, origin: &str) -> TemplateResult<Self> {
        toml::from_str(text).map_err(|e| TemplateError::Parse {
            path: origin.to_string(),
            message: e.to_string(),
        })
    }

    /// All ports after folding the legacy shorthands into the port model.
    pub fn normalized_ports(&self) -> BTreeMap<String, PortDefinition> {
        let mut ports = BTreeMap::new();

        if let Some(roles) = &self.roles {
            for (i, offset) in roles.input.iter().enumerate() {
                ports.insert(
                    format!("port_in_{}", i + 1),
                    PortDefinition::new(
                        PortDirection::Input,
                        default_port_type(),
                        BlockRef::Offset((*offset).into()),
                    ),
                );
            }
            for (i, offset) in roles.output.iter().enumerate() {
                ports.insert(
                    format!("port_out_{}", i + 1),
                    PortDefinition::new(
                        PortDirection::Output,
                        default_port_type(),
                        BlockRef::Offset((*offset).into()),
                    ),
                );
            }
        }

        let legacy = self
            .inputs
            .iter()
            .map(|(name, def)| (format!("input_{name}"), PortDirection::Input, def))
            .chain(
                self.outputs
                    .iter()
                    .map(|(name, def)| (format!("output_{name}"), PortDirection::Output, def)),
            );
        for (name, direction, def) in legacy {
            ports.insert(
                name,
                PortDefinition {
                    direction,
                    port_type: def.port_type.clone(),
                    block: def.block,
                    capabilities: def.capabilities.clone(),
                },
            );
        }

        // Explicit declarations override shorthand-derived ones.
        for (name, def) in &self.ports {
            ports.insert(name.clone(), def.clone());
        }
        ports
    }

    pub fn into_template(
        self,
        source: TemplateSource,
        default_tick_interval: u32,
    ) -> TemplateResult<MultiblockTemplate> {
        let controller = CellPredicate::parse(&self.controller)?;
        let ports = self.normalized_ports();

        let mut builder = MultiblockTemplate::builder(self.id, controller)
            .version(self.version)
            .trigger(self.trigger)
            .tick_interval(self.tick_interval.unwrap_or(default_tick_interval))
            .persistent(self.persistent)
            .source(source);

        for entry in self.pattern {
            let predicate = CellPredicate::parse(&entry.predicate)?;
            builder = if entry.optional {
                builder.optional_entry(entry.offset, predicate)
            } else {
                builder.entry(entry.offset, predicate)
            };
        }
        for (key, value) in self.variables {
            builder = builder.variable(key, value);
        }
        for (id, port) in ports {
            builder = builder.port(id, port);
        }
        for (namespace, value) in self.extensions {
            builder = builder.extension(namespace, value);
        }
        builder.actions = self.actions;
        builder.build()
    }
}

/// Load every `*.toml` file in `dir` (sorted by file name) as a template.
pub fn load_dir(
    dir: &Path,
    origin: TemplateSource,
    default_tick_interval: u32,
) -> TemplateResult<Vec<MultiblockTemplate>> {
    let io_err = |source| TemplateError::Io {
        path: dir.display().to_string(),
        source,
    };

    let mut paths: Vec<_> = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut templates = Vec::with_capacity(paths.len());
    for path in paths {
        let text = std::fs::read_to_string(&path).map_err(|source| TemplateError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let def = TemplateDefinition::from_toml(&text, &path.display().to_string())?;
        templates.push(def.into_template(origin, default_tick_interval)?);
    }
    Ok(templates)
}
