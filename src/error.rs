//! Rich diagnostic error types for the multiblock engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so template authors and host integrators
//! know exactly what went wrong and how to fix it.
//!
//! Assembly failures are deliberately absent: a pattern mismatch or a trigger
//! that does not fire is an ordinary [`AssemblyReport`](crate::assembly::AssemblyReport),
//! not an error.

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the multiblock engine.
#[derive(Debug, Error, Diagnostic)]
pub enum MultiblockError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Trigger(#[from] TriggerError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Capability(#[from] CapabilityError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] crate::config::ConfigError),
}

// ---------------------------------------------------------------------------
// Template errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TemplateError {
    #[error("invalid template id \"{id}\"")]
    #[diagnostic(
        code(multiblock::template::invalid_id),
        help("Template ids are non-blank `namespace:key` strings, e.g. `factory:blast_furnace`.")
    )]
    InvalidId { id: String },

    #[error("invalid predicate expression \"{expression}\": {message}")]
    #[diagnostic(
        code(multiblock::template::predicate),
        help(
            "Valid forms are `air`, `none`, `#group`, `kind`, `kind[key=value,...]`, \
             and alternatives joined with `|`."
        )
    )]
    InvalidPredicate { expression: String, message: String },

    #[error("template {id}: pattern entry at offset {offset} overlaps the controller")]
    #[diagnostic(
        code(multiblock::template::controller_offset),
        help("The controller always sits at offset [0, 0, 0]; remove that pattern entry.")
    )]
    ControllerOffset { id: String, offset: String },

    #[error("template {id}: duplicate pattern offset {offset}")]
    #[diagnostic(
        code(multiblock::template::duplicate_offset),
        help("Each offset may appear only once in a pattern. Merge the predicates with `|`.")
    )]
    DuplicateOffset { id: String, offset: String },

    #[error("template {id}: tick interval must be at least 1")]
    #[diagnostic(
        code(multiblock::template::tick_interval),
        help("Set `tick_interval` to a positive number of ticks (default 20).")
    )]
    InvalidTickInterval { id: String },

    #[error("template {id}: invalid port \"{port}\": {message}")]
    #[diagnostic(
        code(multiblock::template::port),
        help("Ports need a direction (`input`, `output`, `both`) and a block reference.")
    )]
    InvalidPort {
        id: String,
        port: String,
        message: String,
    },

    #[error("duplicate template id \"{id}\"")]
    #[diagnostic(
        code(multiblock::template::duplicate),
        help(
            "Two user-defined templates share the same id. Rename one of them; \
             built-in definitions always win over user definitions."
        )
    )]
    DuplicateTemplate { id: String },

    #[error("failed to parse template file {path}: {message}")]
    #[diagnostic(
        code(multiblock::template::parse),
        help("Check the TOML syntax and field names in the template file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to read template file {path}")]
    #[diagnostic(
        code(multiblock::template::io),
        help("Check that the templates directory exists and is readable.")
    )]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

// ---------------------------------------------------------------------------
// Trigger errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum TriggerError {
    #[error("invalid trigger id \"{id}\"")]
    #[diagnostic(
        code(multiblock::trigger::invalid_id),
        help("Trigger ids have the form `namespace:key` with exactly one colon.")
    )]
    InvalidId { id: String },

    #[error("trigger \"{id}\" is already registered")]
    #[diagnostic(
        code(multiblock::trigger::duplicate),
        help("Each trigger id can be registered once. Pick a different key.")
    )]
    Duplicate { id: String },
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum RegistryError {
    #[error("unknown multiblock template \"{id}\"")]
    #[diagnostic(
        code(multiblock::registry::unknown_template),
        help("Register the template with `register_type` before creating instances of it.")
    )]
    UnknownTemplate { id: String },

    #[error("cell {position} is already claimed by instance {owner}")]
    #[diagnostic(
        code(multiblock::registry::cell_claimed),
        help(
            "Two live instances may never share a cell. Destroy the existing instance \
             or discard the conflicting snapshot."
        )
    )]
    CellClaimed { position: String, owner: u64 },
}

// ---------------------------------------------------------------------------
// Capability errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum CapabilityError {
    #[error("capability \"{kind}\" is already attached to instance {instance}")]
    #[diagnostic(
        code(multiblock::capability::duplicate),
        help("An instance holds at most one capability per kind. Detach the old one first.")
    )]
    Duplicate { kind: String, instance: u64 },
}

// ---------------------------------------------------------------------------
// Storage errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StorageError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(multiblock::storage::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(multiblock::storage::redb),
        help(
            "The embedded database encountered a transaction error. \
             Run `multiblock recover` against the data directory."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(multiblock::storage::serde),
        help("Failed to encode or decode a stored record envelope.")
    )]
    Serialization { message: String },

    #[error("invalid storage identifier \"{segment}\": {reason}")]
    #[diagnostic(
        code(multiblock::storage::invalid_segment),
        help(
            "Namespace, domain and store ids use `[a-z0-9_.-]` and may not contain `..`. \
             Switch `id_mode` to `lenient` to normalize them automatically."
        )
    )]
    InvalidSegment { segment: String, reason: String },

    #[error("record {address}:{key} is corrupted (crc expected {expected:08x}, got {actual:08x})")]
    #[diagnostic(
        code(multiblock::storage::corrupted),
        help("The payload does not match its checksum. Run recovery to quarantine the record.")
    )]
    Corrupted {
        address: String,
        key: String,
        expected: u32,
        actual: u32,
    },

    #[error("record {address}:{key} has schema version {found}, newer than supported {supported}")]
    #[diagnostic(
        code(multiblock::storage::schema_too_new),
        help(
            "The record was written by a newer build. Upgrade before reading this store; \
             records are never truncated to an older schema."
        )
    )]
    SchemaTooNew {
        address: String,
        key: String,
        found: u32,
        supported: u32,
    },

    #[error("migration of {address}:{key} from v{from} to v{to} failed: {message}")]
    #[diagnostic(
        code(multiblock::storage::migration),
        help("The store's migrator rejected the payload.")
    )]
    Migration {
        address: String,
        key: String,
        from: u32,
        to: u32,
        message: String,
    },

    #[error("store {address} is disabled: {reason}")]
    #[diagnostic(
        code(multiblock::storage::disabled),
        help("The store failed repeatedly or the service is not running. Check earlier warnings.")
    )]
    Disabled { address: String, reason: String },

    #[error("write queue for {address} is full ({capacity} pending)")]
    #[diagnostic(
        code(multiblock::storage::queue_full),
        help("Flush the storage service or raise `max_pending_writes`.")
    )]
    QueueFull { address: String, capacity: usize },

    #[error("storage service is not initialized")]
    #[diagnostic(
        code(multiblock::storage::not_initialized),
        help("Call `initialize()` and `recover()` before using stores.")
    )]
    NotInitialized,
}

impl From<std::io::Error> for StorageError {
    fn from(source: std::io::Error) -> Self {
        Self::Io { source }
    }
}

/// Convenience alias for engine-level results.
pub type MultiblockResult<T> = std::result::Result<T, MultiblockError>;
pub type TemplateResult<T> = std::result::Result<T, TemplateError>;
pub type TriggerResult<T> = std::result::Result<T, TriggerError>;
pub type RegistryResult<T> = std::result::Result<T, RegistryError>;
pub type StorageResult<T> = std::result::Result<T, StorageError>;
