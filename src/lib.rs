// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # multiblock
//!
//! Detects, tracks and persists multiblock structures: templates of cell
//! predicates anchored to a controller cell that become live, stateful
//! instances when their pattern matches and a trigger fires.
//!
//! ## Architecture
//!
//! - **Predicates** (`predicate`): composable tests over a single cell
//! - **Pattern matching** (`pattern`): offset lists checked under the four cardinal facings
//! - **Triggers** (`trigger`): namespaced conditions evaluated against an interaction
//! - **Assembly** (`assembly`): trigger → controller → rotation search → instance creation
//! - **Registry** (`registry`): location-indexed live instances, no cell shared
//! - **Ports** (`ports`): logical connectors resolved to world cells
//! - **Storage** (`storage`): checksummed, versioned, journaled key/value stores (redb)
//!
//! ## Library usage
//!
//! ```no_run
//! use multiblock::config::EngineConfig;
//! use multiblock::engine::Engine;
//! use multiblock::geom::{CellPos, WorldId};
//! use multiblock::predicate::CellPredicate;
//! use multiblock::template::MultiblockTemplate;
//! use multiblock::trigger::{self, AssemblyContext};
//! use multiblock::world::{Cell, GridWorld};
//!
//! let engine = Engine::new(EngineConfig::in_memory()).unwrap();
//! engine
//!     .register_template(
//!         MultiblockTemplate::builder("demo:furnace", CellPredicate::exact("iron_block"))
//!             .entry([1, 0, 0], CellPredicate::exact("stone"))
//!             .trigger(trigger::MANUAL_ONLY)
//!             .build()
//!             .unwrap(),
//!     )
//!     .unwrap();
//!
//! let mut world = GridWorld::new();
//! let anchor = CellPos::new(WorldId(0), 0, 64, 0);
//! world.set(anchor, Cell::new("iron_block"));
//! world.set(CellPos::new(WorldId(0), 1, 64, 0), Cell::new("stone"));
//!
//! let report = engine.assemble(&world, anchor, &AssemblyContext::manual());
//! assert!(report.is_success());
//! ```

pub mod assembly;
pub mod behavior;
pub mod capability;
pub mod config;
pub mod engine;
pub mod error;
pub mod geom;
pub mod instance;
pub mod pattern;
pub mod ports;
pub mod predicate;
pub mod registry;
pub mod storage;
pub mod template;
pub mod trigger;
pub mod world;
