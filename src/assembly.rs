//! Assembly coordinator: turns host events into new instances.
//!
//! Each attempt walks the same stages: evaluate the template's trigger,
//! identify the controller cell, search the candidate facings, validate the
//! pattern and finally ask the registry to reserve the footprint. Every
//! outcome, including routine "no match" ones, comes back as an
//! [`AssemblyReport`] value; nothing in here returns an error.
//!
//! Templates are always tried in id order so that identical world state
//! yields the same winning template and facing on every run.

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;

use crate::geom::{CellPos, Facing};
use crate::instance::InstanceId;
use crate::pattern::{PatternOutcome, search_rotations};
use crate::registry::InstanceRegistry;
use crate::template::MultiblockTemplate;
use crate::trigger::{self, ActorId, AssemblyContext, TriggerRegistry};
use crate::world::World;

/// What the pattern matcher concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatcherResult {
    /// The matcher never ran (trigger or controller stopped the attempt).
    Skipped,
    Mismatch,
    Match,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyResult {
    Success,
    /// The structure was checked and found wanting.
    Failed,
    /// The attempt stopped before checking the structure.
    Aborted,
}

/// Furthest stage an attempt reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssemblyStage {
    EvaluateTrigger,
    IdentifyController,
    SearchRotations,
    ValidatePattern,
    CreateInstance,
    Report,
}

impl fmt::Display for MatcherResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "SKIPPED"),
            Self::Mismatch => write!(f, "MISMATCH"),
            Self::Match => write!(f, "MATCH"),
        }
    }
}

impl fmt::Display for AssemblyResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::Failed => write!(f, "FAILED"),
            Self::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Outcome of one assembly attempt.
///
/// `result` is `Success` only when the matcher reported `Match` and the
/// registry accepted the new instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssemblyReport {
    pub trigger_id: String,
    pub trigger_matched: bool,
    pub controller_found: bool,
    pub matcher: MatcherResult,
    pub warnings: Vec<String>,
    pub result: AssemblyResult,
    /// Matched template id; empty when no template matched or when a
    /// controller-first search ended without an instance.
    pub multiblock_id: String,
    pub facing: Option<Facing>,
    pub instance: Option<InstanceId>,
    /// Human-readable failure reason; empty on success.
    pub reason: String,
    pub position: CellPos,
    pub stage: AssemblyStage,
}

impl AssemblyReport {
    fn new(position: CellPos) -> Self {
        Self {
            trigger_id: String::new(),
            trigger_matched: false,
            controller_found: false,
            matcher: MatcherResult::Skipped,
            warnings: Vec::new(),
            result: AssemblyResult::Failed,
            multiblock_id: String::new(),
            facing: None,
            instance: None,
            reason: String::new(),
            position,
            stage: AssemblyStage::EvaluateTrigger,
        }
    }

    fn aborted(mut self, reason: impl Into<String>) -> Self {
        self.result = AssemblyResult::Aborted;
        self.reason = reason.into();
        self
    }

    fn failed(mut self, reason: impl Into<String>) -> Self {
        self.result = AssemblyResult::Failed;
        self.reason = reason.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.result == AssemblyResult::Success
    }
}

/// Drives assembly attempts against the shared registries.
pub struct AssemblyCoordinator {
    registry: Arc<InstanceRegistry>,
    triggers: Arc<TriggerRegistry>,
    last_reports: DashMap<ActorId, AssemblyReport>,
}

impl AssemblyCoordinator {
    pub fn new(registry: Arc<InstanceRegistry>, triggers: Arc<TriggerRegistry>) -> Self {
        Self {
            registry,
            triggers,
            last_reports: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &Arc<InstanceRegistry> {
        &self.registry
    }

    pub fn triggers(&self) -> &Arc<TriggerRegistry> {
        &self.triggers
    }

    /// Try every registered template whose controller predicate accepts the
    /// cell at `candidate`; the first to assemble wins.
    pub fn try_assemble_at(
        &self,
        world: &dyn World,
        candidate: CellPos,
        ctx: &AssemblyContext,
    ) -> AssemblyReport {
        let report = self.assemble_any(world, candidate, ctx);
        self.record(ctx, report)
    }

    /// Run the pipeline for a single template.
    pub fn try_assemble_type_at(
        &self,
        world: &dyn World,
        template: &Arc<MultiblockTemplate>,
        candidate: CellPos,
        ctx: &AssemblyContext,
    ) -> AssemblyReport {
        let report = if self.registry.is_reserved(candidate) {
            AssemblyReport::new(candidate).aborted("Instance already exists")
        } else {
            self.attempt(world, template, candidate, ctx)
        };
        self.record(ctx, report)
    }

    /// Assemble place-triggered templates around a freshly placed cell.
    ///
    /// The placed cell may be the controller or any member of the structure
    /// under any facing, so every controller position that could explain it
    /// is tried.
    pub fn try_assemble_from_placed(
        &self,
        world: &dyn World,
        placed: CellPos,
        ctx: &AssemblyContext,
    ) -> AssemblyReport {
        let mut last = None;
        let templates = self
            .registry
            .types()
            .into_iter()
            .filter(|t| t.trigger() == trigger::ON_FINAL_BLOCK_PLACED);

        for template in templates {
            for candidate in controller_candidates(&template, placed) {
                if self.registry.is_reserved(candidate) {
                    continue;
                }
                let controller_ok = world
                    .cell(candidate)
                    .is_some_and(|cell| template.controller().matches(&cell));
                if !controller_ok {
                    continue;
                }
                let report = self.attempt(world, &template, candidate, ctx);
                if report.is_success() {
                    return self.record(ctx, report);
                }
                last = Some(report);
            }
        }

        let report = last.unwrap_or_else(|| {
            let mut report = AssemblyReport::new(placed);
            report.stage = AssemblyStage::IdentifyController;
            report.failed("No multiblock matches this placement")
        });
        self.record(ctx, report)
    }

    /// Most recent report for an actor.
    pub fn last_report(&self, actor: &ActorId) -> Option<AssemblyReport> {
        self.last_reports.get(actor).map(|r| r.value().clone())
    }

    fn assemble_any(&self, world: &dyn World, candidate: CellPos, ctx: &AssemblyContext) -> AssemblyReport {
        if self.registry.is_reserved(candidate) {
            return AssemblyReport::new(candidate).aborted("Instance already exists");
        }
        let Some(cell) = world.cell(candidate) else {
            let mut report = AssemblyReport::new(candidate);
            report.stage = AssemblyStage::IdentifyController;
            return report.failed("Controller region is not loaded");
        };

        let mut last = None;
        for template in self.registry.types() {
            if !template.controller().matches(&cell) {
                continue;
            }
            let report = self.attempt(world, &template, candidate, ctx);
            if report.is_success() {
                return report;
            }
            last = Some(report);
        }

        let mut report = last.unwrap_or_else(|| {
            let mut report = AssemblyReport::new(candidate);
            report.stage = AssemblyStage::IdentifyController;
            report.reason = "No multiblock matches this controller".into();
            report
        });
        // No template assembled here, so none is reported as matched; the
        // reason still names the last rejection (an overlap, for instance).
        report.result = AssemblyResult::Failed;
        report.matcher = MatcherResult::Mismatch;
        report.multiblock_id.clear();
        report
    }

    fn attempt(
        &self,
        world: &dyn World,
        template: &Arc<MultiblockTemplate>,
        candidate: CellPos,
        ctx: &AssemblyContext,
    ) -> AssemblyReport {
        let mut report = AssemblyReport::new(candidate);
        report.trigger_id = template.trigger().to_string();

        let Some(evaluator) = self.triggers.get(template.trigger()) else {
            return report.aborted(format!("Unknown trigger: {}", template.trigger()));
        };
        if !evaluator.fires(ctx) {
            return report.aborted("Trigger not matched");
        }
        report.trigger_matched = true;

        report.stage = AssemblyStage::IdentifyController;
        let Some(cell) = world.cell(candidate) else {
            return report.failed("Controller region is not loaded");
        };
        let check = template.controller().check(&cell);
        if !check.success {
            return report.failed(format!("Controller mismatch: {}", check.reason));
        }
        report.controller_found = true;

        report.stage = AssemblyStage::SearchRotations;
        let outcome = search_rotations(world, candidate, template, &cell);

        report.stage = AssemblyStage::ValidatePattern;
        let (facing, missing) = match outcome {
            PatternOutcome::Match {
                facing,
                missing_optional,
            } => (facing, missing_optional),
            PatternOutcome::Mismatch { facing, reason } => {
                report.matcher = MatcherResult::Mismatch;
                report.facing = Some(facing);
                return report.failed(format!("Pattern mismatch: {reason}"));
            }
        };
        report.matcher = MatcherResult::Match;
        report.facing = Some(facing);
        report.multiblock_id = template.id().to_string();
        report.warnings.extend(
            missing
                .iter()
                .map(|o| format!("optional entry at {o} is missing")),
        );

        report.stage = AssemblyStage::CreateInstance;
        let Some(handle) = self.registry.try_create(candidate, template, facing, ctx.actor()) else {
            return report.failed("Overlaps existing multiblock");
        };
        report.instance = Some(handle.read().expect("instance lock poisoned").id());

        report.stage = AssemblyStage::Report;
        report.result = AssemblyResult::Success;
        report
    }

    fn record(&self, ctx: &AssemblyContext, report: AssemblyReport) -> AssemblyReport {
        tracing::debug!(
            trigger = %report.trigger_id,
            result = %report.result,
            matcher = %report.matcher,
            template = %report.multiblock_id,
            reason = %report.reason,
            position = %report.position,
            "assembly attempt"
        );
        if let Some(actor) = ctx.actor() {
            self.last_reports.insert(actor.clone(), report.clone());
        }
        report
    }
}

impl fmt::Debug for AssemblyCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssemblyCoordinator")
            .field("registry", &self.registry)
            .field("triggers", &self.triggers)
            .field("reports", &self.last_reports.len())
            .finish()
    }
}

/// Controller positions that could explain a cell placed at `placed`: the
/// cell itself, then `placed` minus every rotated offset, deduplicated in
/// first-seen order.
fn controller_candidates(template: &MultiblockTemplate, placed: CellPos) -> Vec<CellPos> {
    let mut out = vec![placed];
    for facing in Facing::ALL {
        for entry in template.pattern() {
            let candidate = placed - facing.rotate(entry.offset);
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }
    out
}
