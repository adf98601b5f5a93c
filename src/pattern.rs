//! Pattern matcher: checks a template's offsets against the world.
//!
//! Offsets are rotated into world space by the candidate [`Facing`] before
//! the cell under them is tested. Mandatory entries must all hold; optional
//! entries never block a match but are reported so callers can warn.
//! A cell in an unloaded region fails the match outright.

use crate::geom::{CellPos, Facing, Offset};
use crate::template::MultiblockTemplate;
use crate::world::{Cell, World};

/// Result of matching one template at one anchor under one facing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternOutcome {
    Match {
        facing: Facing,
        /// Optional entries whose predicate did not hold (template-space offsets).
        missing_optional: Vec<Offset>,
    },
    Mismatch {
        facing: Facing,
        reason: String,
    },
}

impl PatternOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Match { .. })
    }
}

/// Evaluate every pattern entry of `template` anchored at `anchor`.
pub fn match_pattern(
    world: &dyn World,
    anchor: CellPos,
    template: &MultiblockTemplate,
    facing: Facing,
) -> PatternOutcome {
    let mut missing_optional = Vec::new();

    for entry in template.pattern() {
        let target = anchor + facing.rotate(entry.offset);
        let Some(cell) = world.cell(target) else {
            return PatternOutcome::Mismatch {
                facing,
                reason: format!("region at {target} is not loaded"),
            };
        };

        let check = entry.predicate.check(&cell);
        if check.success {
            continue;
        }
        if entry.optional {
            missing_optional.push(entry.offset);
            continue;
        }
        return PatternOutcome::Mismatch {
            facing,
            reason: format!("{target}: {}", check.reason),
        };
    }

    PatternOutcome::Match {
        facing,
        missing_optional,
    }
}

/// Boolean form of [`match_pattern`].
pub fn pattern_matches(
    world: &dyn World,
    anchor: CellPos,
    template: &MultiblockTemplate,
    facing: Facing,
) -> bool {
    match_pattern(world, anchor, template, facing).is_match()
}

/// Facings worth trying for a controller cell, in search order.
///
/// A controller with an intrinsic direction only admits that direction;
/// otherwise all four are tried as north, east, south, west.
pub fn candidate_facings(controller: &Cell) -> Vec<Facing> {
    match controller.facing() {
        Some(facing) => vec![facing],
        None => Facing::ALL.to_vec(),
    }
}

/// Try each candidate facing in order and return the first full match.
///
/// When nothing matches, the mismatch of the first candidate is returned
/// since it is the most natural orientation to explain to a player.
pub fn search_rotations(
    world: &dyn World,
    anchor: CellPos,
    template: &MultiblockTemplate,
    controller: &Cell,
) -> PatternOutcome {
    let mut first_mismatch = None;
    for facing in candidate_facings(controller) {
        let outcome = match_pattern(world, anchor, template, facing);
        if outcome.is_match() {
            return outcome;
        }
        first_mismatch.get_or_insert(outcome);
    }
    first_mismatch.unwrap_or(PatternOutcome::Mismatch {
        facing: Facing::North,
        reason: "no facing to try".into(),
    })
}
