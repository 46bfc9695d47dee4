//! Classifies an experiment's health from its inventory.
//!
//! Priority, most severe first: structural schema problems, missing raw data,
//! bad reports, stale aggregates. Raw-data completeness is always checked per
//! replication from the files themselves and never inferred from aggregate
//! freshness.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::Utc;
use lab_analysis::DerivedState;
use lab_core::{atomic_write_bytes, layout, Verdict};
use serde::Serialize;
use tracing::{info, warn};

use crate::inventory::{self, ExperimentInventory, RawFileState, ReplicationInventory};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationHealth {
    Valid,
    NeedsReprocess,
    NeedsRepair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    /// Schema mismatch or unreadable snapshot; only migration fixes it.
    Structural,
    /// Missing or empty query/response data; needs the replication engine.
    DataIncomplete,
    /// Report or aggregate that can be regenerated locally.
    StaleDerived,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub replication: Option<u32>,
    pub detail: String,
}

/// Coarse lifecycle position, reported alongside the verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Lifecycle {
    New,
    InProgress,
    Complete,
    Degraded,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AuditOptions {
    pub verbose: bool,
    /// Write the report to `experiment_audit_log.txt` inside the experiment.
    pub write_log: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReplicationStatus {
    pub index: u32,
    pub health: ReplicationHealth,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditOutcome {
    pub verdict: Verdict,
    pub lifecycle: Lifecycle,
    pub replications: Vec<ReplicationStatus>,
    pub findings: Vec<Finding>,
    #[serde(skip)]
    pub inventory: ExperimentInventory,
    #[serde(skip)]
    pub report_text: String,
}

impl AuditOutcome {
    pub fn replications_with(&self, health: ReplicationHealth) -> Vec<u32> {
        self.replications
            .iter()
            .filter(|r| r.health == health)
            .map(|r| r.index)
            .collect()
    }

    pub fn health_of(&self, index: u32) -> Option<ReplicationHealth> {
        self.replications
            .iter()
            .find(|r| r.index == index)
            .map(|r| r.health)
    }
}

fn describe_raw(state: &RawFileState) -> &str {
    match state {
        RawFileState::Present => "present",
        RawFileState::Missing => "missing",
        RawFileState::Empty => "empty",
        RawFileState::Unparsable(msg) => msg,
    }
}

fn describe_derived(state: &DerivedState) -> String {
    match state {
        DerivedState::Fresh => "fresh".to_string(),
        DerivedState::Missing => "missing".to_string(),
        DerivedState::Stale => "stale".to_string(),
        DerivedState::Unparsable(msg) => format!("unparsable ({})", msg),
    }
}

fn replication_health(rep: &ReplicationInventory, findings: &mut Vec<Finding>) -> ReplicationHealth {
    if !rep.dir_present {
        findings.push(Finding {
            kind: FindingKind::DataIncomplete,
            replication: Some(rep.index),
            detail: format!("{} does not exist", layout::replication_dir_name(rep.index)),
        });
        return ReplicationHealth::NeedsRepair;
    }
    let mut incomplete = false;
    for t in &rep.trials {
        for (label, state) in [("query", &t.query), ("response", &t.response)] {
            if !state.is_present() {
                incomplete = true;
                findings.push(Finding {
                    kind: FindingKind::DataIncomplete,
                    replication: Some(rep.index),
                    detail: format!("trial {} {} is {}", t.trial, label, describe_raw(state)),
                });
            }
        }
    }
    if incomplete {
        return ReplicationHealth::NeedsRepair;
    }
    if !rep.report.is_fresh() {
        findings.push(Finding {
            kind: FindingKind::StaleDerived,
            replication: Some(rep.index),
            detail: format!(
                "{} is {}",
                layout::report_file_name(rep.index),
                describe_derived(&rep.report)
            ),
        });
        return ReplicationHealth::NeedsReprocess;
    }
    ReplicationHealth::Valid
}

/// Pure classification of an inventory.
pub fn classify(inv: &ExperimentInventory) -> (Verdict, Vec<ReplicationStatus>, Vec<Finding>) {
    let mut findings: Vec<Finding> = inv
        .structural
        .iter()
        .map(|issue| Finding {
            kind: FindingKind::Structural,
            replication: None,
            detail: issue.describe(),
        })
        .collect();

    let statuses: Vec<ReplicationStatus> = inv
        .replications
        .iter()
        .map(|rep| ReplicationStatus {
            index: rep.index,
            health: replication_health(rep, &mut findings),
        })
        .collect();

    let all_valid = statuses.iter().all(|s| s.health == ReplicationHealth::Valid);
    if all_valid && !inv.aggregates.is_fresh() {
        for (name, state) in [
            (layout::EXPERIMENT_RESULTS, &inv.aggregates.results),
            (layout::BATCH_RUN_LOG, &inv.aggregates.batch_log),
        ] {
            if !state.is_fresh() {
                findings.push(Finding {
                    kind: FindingKind::StaleDerived,
                    replication: None,
                    detail: format!("{} is {}", name, describe_derived(state)),
                });
            }
        }
    }

    let verdict = if !inv.structural.is_empty() {
        Verdict::NeedsMigration
    } else if statuses.iter().any(|s| s.health == ReplicationHealth::NeedsRepair) {
        Verdict::NeedsRepair
    } else if statuses.iter().any(|s| s.health == ReplicationHealth::NeedsReprocess) {
        Verdict::NeedsReprocess
    } else if !inv.aggregates.is_fresh() {
        Verdict::NeedsAggregation
    } else {
        Verdict::AllValid
    };
    (verdict, statuses, findings)
}

fn lifecycle(inv: &ExperimentInventory, verdict: Verdict) -> Lifecycle {
    if verdict == Verdict::AllValid {
        Lifecycle::Complete
    } else if inv.found_dirs.is_empty() {
        Lifecycle::New
    } else if inv.replications.iter().any(|r| !r.dir_present) && inv.structural.is_empty() {
        Lifecycle::InProgress
    } else {
        Lifecycle::Degraded
    }
}

fn recommendation(verdict: Verdict) -> &'static str {
    match verdict {
        Verdict::AllValid => "no action required",
        Verdict::NeedsAggregation => "rebuild experiment aggregates (lab repair)",
        Verdict::NeedsReprocess => "regenerate reports from local data (lab repair)",
        Verdict::NeedsRepair => "re-run the affected replications (lab repair; makes API calls)",
        Verdict::NeedsMigration => "upgrade the directory structure first (lab migrate)",
    }
}

fn render_report(outcome: &AuditOutcome, verbose: bool) -> String {
    let inv = &outcome.inventory;
    let mut out = String::new();
    let _ = writeln!(out, "Experiment audit: {}", inv.path.display());
    let _ = writeln!(out, "Generated: {}", Utc::now().to_rfc3339());
    let _ = writeln!(
        out,
        "Expected: {} replications x {} trials",
        inv.expected_replications, inv.expected_trials
    );
    let _ = writeln!(out, "Lifecycle: {:?}", outcome.lifecycle);
    out.push('\n');

    if !inv.structural.is_empty() {
        let _ = writeln!(out, "Structural issues:");
        for issue in &inv.structural {
            let _ = writeln!(out, "  - {}", issue.describe());
        }
        out.push('\n');
    }

    let _ = writeln!(out, "Replications:");
    for status in &outcome.replications {
        let label = match status.health {
            ReplicationHealth::Valid => "valid",
            ReplicationHealth::NeedsReprocess => "needs reprocess",
            ReplicationHealth::NeedsRepair => "needs repair",
        };
        let _ = writeln!(
            out,
            "  {}  {}",
            layout::replication_dir_name(status.index),
            label
        );
        if verbose {
            for f in outcome
                .findings
                .iter()
                .filter(|f| f.replication == Some(status.index))
            {
                let _ = writeln!(out, "      {}", f.detail);
            }
        }
    }
    out.push('\n');

    let aggregates = &inv.aggregates;
    let _ = writeln!(out, "Aggregates:");
    if aggregates.evaluated {
        let _ = writeln!(
            out,
            "  {}  {}",
            layout::EXPERIMENT_RESULTS,
            describe_derived(&aggregates.results)
        );
        let _ = writeln!(
            out,
            "  {}  {}",
            layout::BATCH_RUN_LOG,
            describe_derived(&aggregates.batch_log)
        );
    } else {
        let _ = writeln!(out, "  not evaluated (replications incomplete)");
    }
    out.push('\n');

    let _ = writeln!(out, "Verdict: {}", outcome.verdict);
    let _ = writeln!(out, "Recommendation: {}", recommendation(outcome.verdict));
    out
}

/// Audits the experiment at `path`. Problems found become part of the
/// verdict; the only errors are an unreadable experiment path or a failed
/// write of the audit log.
pub fn audit(path: &Path, options: AuditOptions) -> Result<AuditOutcome> {
    let inventory = inventory::scan(path)?;
    let (verdict, replications, findings) = classify(&inventory);
    let mut outcome = AuditOutcome {
        verdict,
        lifecycle: lifecycle(&inventory, verdict),
        replications,
        findings,
        inventory,
        report_text: String::new(),
    };
    outcome.report_text = render_report(&outcome, options.verbose);

    if verdict.is_valid() {
        info!(experiment = %path.display(), %verdict, "audit complete");
    } else {
        warn!(
            experiment = %path.display(),
            %verdict,
            findings = outcome.findings.len(),
            "audit found problems"
        );
    }
    if options.write_log {
        atomic_write_bytes(&path.join(layout::AUDIT_LOG), outcome.report_text.as_bytes())?;
    }
    Ok(outcome)
}
