//! Pure mapping from an audit outcome to the cheapest action that fixes it.

use std::fmt;
use std::ops::RangeInclusive;

use lab_core::Verdict;
use serde::{Deserialize, Serialize};

use crate::audit::{AuditOutcome, ReplicationHealth};

/// Actions an operator can force on an experiment that audits as valid, for
/// instance after fixing a bug in report extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForcedAction {
    FullRepair,
    Reprocess,
    Aggregate,
}

impl ForcedAction {
    pub const ALL: [ForcedAction; 3] = [
        ForcedAction::FullRepair,
        ForcedAction::Reprocess,
        ForcedAction::Aggregate,
    ];

    pub fn label(self) -> &'static str {
        match self {
            ForcedAction::FullRepair => "force full repair (deletes and re-runs every replication)",
            ForcedAction::Reprocess => "force reprocess (regenerate every report)",
            ForcedAction::Aggregate => "force aggregation only",
        }
    }
}

/// Optional replication bounds given on the repair command line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepairScope {
    pub start: Option<u32>,
    pub end: Option<u32>,
}

impl RepairScope {
    pub fn contains(&self, index: u32) -> bool {
        self.start.map_or(true, |s| index >= s) && self.end.map_or(true, |e| index <= e)
    }

    pub fn is_restricted(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    NoOp,
    Aggregate,
    Reprocess,
    Repair,
    /// Structural problems: stop and point the operator at migration.
    Halt,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairAction {
    pub kind: ActionKind,
    /// Affected replication indices, ascending.
    pub replications: Vec<u32>,
    pub requires_confirmation: bool,
    pub destructive: bool,
    pub forced: bool,
    pub reason: String,
    /// Bounds the local follow-up work (report regeneration) as well.
    pub scope: RepairScope,
}

impl RepairAction {
    fn new(kind: ActionKind, replications: Vec<u32>, reason: impl Into<String>) -> Self {
        RepairAction {
            kind,
            replications,
            requires_confirmation: false,
            destructive: false,
            forced: false,
            reason: reason.into(),
            scope: RepairScope::default(),
        }
    }

    pub fn range(&self) -> Option<RangeInclusive<u32>> {
        let first = *self.replications.first()?;
        let last = *self.replications.last()?;
        Some(first..=last)
    }

    /// Forced destructive repairs ask a second time before deleting data.
    pub fn needs_second_confirmation(&self) -> bool {
        self.forced && self.destructive
    }
}

impl fmt::Display for RepairAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            ActionKind::NoOp => "no-op",
            ActionKind::Aggregate => "rebuild aggregates",
            ActionKind::Reprocess => "regenerate reports",
            ActionKind::Repair => "re-run replications",
            ActionKind::Halt => "halt (migration required)",
        };
        write!(f, "{}", kind)?;
        if !self.replications.is_empty() {
            let list: Vec<String> = self.replications.iter().map(u32::to_string).collect();
            write!(f, " [{}]", list.join(", "))?;
        }
        if self.destructive {
            write!(f, " (destructive)")?;
        }
        write!(f, ": {}", self.reason)
    }
}

fn forced_action(outcome: &AuditOutcome, forced: ForcedAction, scope: RepairScope) -> RepairAction {
    let all: Vec<u32> = outcome
        .replications
        .iter()
        .map(|r| r.index)
        .filter(|i| scope.contains(*i))
        .collect();
    let mut action = match forced {
        ForcedAction::FullRepair => {
            let destructive = outcome
                .inventory
                .replications
                .iter()
                .any(|r| all.contains(&r.index) && r.file_count > 0);
            let mut a = RepairAction::new(ActionKind::Repair, all, "forced full repair");
            a.requires_confirmation = true;
            a.destructive = destructive;
            a
        }
        ForcedAction::Reprocess => RepairAction::new(ActionKind::Reprocess, all, "forced reprocess"),
        ForcedAction::Aggregate => {
            RepairAction::new(ActionKind::Aggregate, Vec::new(), "forced aggregation")
        }
    };
    action.forced = true;
    action
}

/// Chooses the action for an audited experiment. `forced` only applies when
/// the experiment is `ALL_VALID`; otherwise the verdict decides.
pub fn select_action(
    outcome: &AuditOutcome,
    scope: RepairScope,
    forced: Option<ForcedAction>,
) -> RepairAction {
    let mut action = action_for(outcome, scope, forced);
    action.scope = scope;
    action
}

fn action_for(outcome: &AuditOutcome, scope: RepairScope, forced: Option<ForcedAction>) -> RepairAction {
    let in_scope = |health: ReplicationHealth| -> Vec<u32> {
        outcome
            .replications_with(health)
            .into_iter()
            .filter(|i| scope.contains(*i))
            .collect()
    };
    match outcome.verdict {
        Verdict::NeedsMigration => RepairAction::new(
            ActionKind::Halt,
            Vec::new(),
            "directory does not match the current schema; run the migration workflow",
        ),
        Verdict::NeedsRepair => {
            let targets = in_scope(ReplicationHealth::NeedsRepair);
            if targets.is_empty() {
                return RepairAction::new(
                    ActionKind::NoOp,
                    Vec::new(),
                    "no replication needing repair falls inside the requested range",
                );
            }
            let destructive = outcome
                .inventory
                .replications
                .iter()
                .any(|r| targets.contains(&r.index) && r.file_count > 0);
            let mut action = RepairAction::new(
                ActionKind::Repair,
                targets,
                "missing or empty query/response data",
            );
            action.requires_confirmation = true;
            action.destructive = destructive;
            action
        }
        Verdict::NeedsReprocess => {
            let targets = in_scope(ReplicationHealth::NeedsReprocess);
            if targets.is_empty() {
                return RepairAction::new(
                    ActionKind::NoOp,
                    Vec::new(),
                    "no replication needing reprocess falls inside the requested range",
                );
            }
            RepairAction::new(ActionKind::Reprocess, targets, "missing, stale or unparsable reports")
        }
        Verdict::NeedsAggregation => RepairAction::new(
            ActionKind::Aggregate,
            Vec::new(),
            "experiment aggregates missing or stale",
        ),
        Verdict::AllValid => match forced {
            Some(f) => forced_action(outcome, f, scope),
            None => RepairAction::new(ActionKind::NoOp, Vec::new(), "experiment is valid"),
        },
    }
}
