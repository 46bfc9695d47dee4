//! Study-level coordination: audit every experiment, aggregate verdicts, and
//! sequence batch repair and migration behind a single confirmation gate.
//!
//! Experiments are always processed one at a time in natural name order
//! (`exp_2` before `exp_10`), never in filesystem enumeration order.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use lab_analysis::{
    check_aggregate, render_study_batch_log, render_study_results, study_header, DerivedState,
    ReportEntry, BATCH_LOG_HEADER, RESULTS_HEADER,
};
use lab_core::{atomic_write_bytes, layout, LabError, Verdict};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{audit, AuditOptions, AuditOutcome};
use crate::engine::ReplicationEngine;
use crate::migrate::{migrate_experiment, plan_migration, MigrationStatus};
use crate::prompt::{choose_forced_action, AssumeYes, Prompt};
use crate::repair::execute;
use crate::select::{select_action, ActionKind, ForcedAction, RepairAction, RepairScope};

#[derive(Debug, Clone, Serialize)]
pub struct ExperimentAudit {
    pub name: String,
    pub path: PathBuf,
    pub outcome: AuditOutcome,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyAggregates {
    pub results: DerivedState,
    pub batch_log: DerivedState,
    /// Only evaluated once every experiment is valid.
    pub evaluated: bool,
}

impl StudyAggregates {
    pub fn is_fresh(&self) -> bool {
        self.evaluated && self.results.is_fresh() && self.batch_log.is_fresh()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyAudit {
    pub path: PathBuf,
    pub experiments: Vec<ExperimentAudit>,
    pub aggregates: StudyAggregates,
    pub overall: Verdict,
    #[serde(skip)]
    pub report_text: String,
}

impl StudyAudit {
    pub fn all_experiments_valid(&self) -> bool {
        self.experiments.iter().all(|e| e.outcome.verdict.is_valid())
    }

    /// Every experiment is valid but the study tables are missing or stale.
    /// Reported alongside the verdict, never folded into it.
    pub fn needs_compile(&self) -> bool {
        !self.experiments.is_empty() && self.all_experiments_valid() && !self.aggregates.is_fresh()
    }

    fn names_with(&self, verdict: Verdict) -> Vec<String> {
        self.experiments
            .iter()
            .filter(|e| e.outcome.verdict == verdict)
            .map(|e| e.name.clone())
            .collect()
    }
}

fn looks_like_experiment(dir: &Path) -> bool {
    if dir.join(layout::CONFIG_SNAPSHOT).is_file() {
        return true;
    }
    walkdir::WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .any(|e| {
            e.file_type().is_dir()
                && layout::classify_dir_name(&e.file_name().to_string_lossy())
                    .index()
                    .is_some()
        })
}

/// Experiment directories directly under `study`, in natural name order.
pub fn discover_experiments(study: &Path) -> Result<Vec<(String, PathBuf)>> {
    if !study.is_dir() {
        return Err(anyhow!("study directory not found: {}", study.display()));
    }
    let mut out = Vec::new();
    for entry in walkdir::WalkDir::new(study).min_depth(1).max_depth(1) {
        let entry = entry.with_context(|| format!("listing {}", study.display()))?;
        if !entry.file_type().is_dir() || !looks_like_experiment(entry.path()) {
            continue;
        }
        out.push((
            entry.file_name().to_string_lossy().to_string(),
            entry.path().to_path_buf(),
        ));
    }
    out.sort_by_key(|(name, _)| layout::natural_key(name));
    Ok(out)
}

fn study_entries(experiments: &[ExperimentAudit]) -> Option<Vec<(String, Vec<ReportEntry>)>> {
    if experiments.is_empty() {
        return None;
    }
    experiments
        .iter()
        .map(|e| {
            if !e.outcome.verdict.is_valid() {
                return None;
            }
            e.outcome
                .inventory
                .fresh_reports()
                .map(|entries| (e.name.clone(), entries))
        })
        .collect()
}

fn scan_study_aggregates(study: &Path, experiments: &[ExperimentAudit]) -> StudyAggregates {
    let results_path = study.join(layout::STUDY_RESULTS);
    let log_path = study.join(layout::STUDY_BATCH_LOG);
    let rendered = study_entries(experiments).and_then(|entries| {
        Some((
            render_study_results(&entries).ok()?,
            render_study_batch_log(&entries).ok()?,
        ))
    });
    match rendered {
        Some((results, batch_log)) => StudyAggregates {
            results: check_aggregate(&results_path, &results, &study_header(&RESULTS_HEADER)),
            batch_log: check_aggregate(&log_path, &batch_log, &study_header(&BATCH_LOG_HEADER)),
            evaluated: true,
        },
        None => StudyAggregates {
            results: DerivedState::Missing,
            batch_log: DerivedState::Missing,
            evaluated: false,
        },
    }
}

fn render_study_report(audit: &StudyAudit, verbose: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Study audit: {}", audit.path.display());
    let _ = writeln!(out, "Generated: {}", Utc::now().to_rfc3339());
    let _ = writeln!(out, "Experiments: {}", audit.experiments.len());
    if audit.experiments.is_empty() {
        let _ = writeln!(out, "  (no experiment directories found)");
    }
    let width = audit
        .experiments
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or(0);
    for e in &audit.experiments {
        let _ = writeln!(out, "  {:<width$}  {}", e.name, e.outcome.verdict, width = width);
    }
    out.push('\n');
    if audit.aggregates.evaluated {
        let _ = writeln!(
            out,
            "Study aggregates: {} {:?}, {} {:?}",
            layout::STUDY_RESULTS,
            audit.aggregates.results,
            layout::STUDY_BATCH_LOG,
            audit.aggregates.batch_log
        );
    } else {
        let _ = writeln!(out, "Study aggregates: not evaluated (experiments not all valid)");
    }
    if audit.needs_compile() {
        let _ = writeln!(
            out,
            "Study aggregates need rebuilding (lab repair-study or lab compile-study)"
        );
    }
    let _ = writeln!(out, "Overall verdict: {}", audit.overall);
    if verbose {
        for e in &audit.experiments {
            let _ = writeln!(out, "\n=== {} ===", e.name);
            out.push_str(&e.outcome.report_text);
        }
    }
    out
}

/// Audits every experiment of the study. The overall verdict is the most
/// severe child verdict; stale study aggregates show up in
/// [`StudyAudit::needs_compile`] instead.
pub fn audit_study(study: &Path, options: AuditOptions) -> Result<StudyAudit> {
    let mut experiments = Vec::new();
    for (name, path) in discover_experiments(study)? {
        let outcome = audit(&path, options)?;
        experiments.push(ExperimentAudit {
            name,
            path,
            outcome,
        });
    }
    let aggregates = scan_study_aggregates(study, &experiments);
    let overall = Verdict::worst(experiments.iter().map(|e| e.outcome.verdict));
    let mut audit = StudyAudit {
        path: study.to_path_buf(),
        experiments,
        aggregates,
        overall,
        report_text: String::new(),
    };
    audit.report_text = render_study_report(&audit, options.verbose);
    if options.write_log {
        atomic_write_bytes(
            &study.join(layout::STUDY_AUDIT_LOG),
            audit.report_text.as_bytes(),
        )?;
    }
    info!(study = %study.display(), overall = %audit.overall, "study audit complete");
    Ok(audit)
}

/// Rebuilds the study-level master results table and consolidated log.
/// Refused unless every experiment audits as valid.
pub fn compile_study(study: &Path) -> Result<()> {
    let audit = audit_study(study, AuditOptions::default())?;
    compile_from_audit(&audit)
}

fn compile_from_audit(audit: &StudyAudit) -> Result<()> {
    let entries = study_entries(&audit.experiments).ok_or_else(|| {
        let pending: Vec<String> = audit
            .experiments
            .iter()
            .filter(|e| !e.outcome.verdict.is_valid())
            .map(|e| format!("{} ({})", e.name, e.outcome.verdict))
            .collect();
        LabError::Refused(format!(
            "study aggregation needs every experiment valid; pending: {}",
            if pending.is_empty() {
                "no experiments found".to_string()
            } else {
                pending.join(", ")
            }
        ))
    })?;
    let results = render_study_results(&entries).context("render study results")?;
    let batch_log = render_study_batch_log(&entries).context("render study batch log")?;
    atomic_write_bytes(&audit.path.join(layout::STUDY_RESULTS), &results)?;
    atomic_write_bytes(&audit.path.join(layout::STUDY_BATCH_LOG), &batch_log)?;
    info!(study = %audit.path.display(), experiments = entries.len(), "study aggregates rebuilt");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    pub experiment: String,
    #[serde(skip)]
    pub path: PathBuf,
    pub action: RepairAction,
}

/// An experiment together with why it was deferred or where it failed.
#[derive(Debug, Clone, Serialize)]
pub struct ExperimentNote {
    pub experiment: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyPlan {
    pub actions: Vec<PlannedAction>,
    pub deferred: Vec<ExperimentNote>,
    pub rebuild_study_aggregates: bool,
}

/// Per-experiment actions for a batch repair. Experiments needing migration
/// are deferred: migration waits until no experiment needs ordinary repair.
/// `forced` is only honoured when every experiment is already valid.
pub fn plan_study_repair(audit: &StudyAudit, forced: Option<ForcedAction>) -> StudyPlan {
    let forced = if audit.all_experiments_valid() {
        forced
    } else {
        None
    };
    let mut actions = Vec::new();
    let mut deferred = Vec::new();
    for e in &audit.experiments {
        let action = select_action(&e.outcome, RepairScope::default(), forced);
        match action.kind {
            ActionKind::NoOp => {}
            ActionKind::Halt => deferred.push(ExperimentNote {
                experiment: e.name.clone(),
                reason: "needs migration; run migrate-study once repairs are complete".to_string(),
            }),
            _ => actions.push(PlannedAction {
                experiment: e.name.clone(),
                path: e.path.clone(),
                action,
            }),
        }
    }
    let rebuild_study_aggregates = deferred.is_empty()
        && !audit.experiments.is_empty()
        && (!actions.is_empty() || !audit.aggregates.is_fresh());
    StudyPlan {
        actions,
        deferred,
        rebuild_study_aggregates,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    NoOp,
    Completed,
    Aborted,
    /// Stopped at the first experiment that failed or did not converge.
    Halted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyRepairOutcome {
    pub status: BatchStatus,
    pub plan: StudyPlan,
    pub completed: Vec<String>,
    pub failed: Option<ExperimentNote>,
    pub not_attempted: Vec<String>,
    #[serde(skip)]
    pub post: Option<StudyAudit>,
}

fn batch_question(study: &Path, plan: &StudyPlan) -> String {
    let mut q = format!("Apply the following to {}?", study.display());
    for p in &plan.actions {
        let _ = write!(q, "\n  {}: {}", p.experiment, p.action);
    }
    for d in &plan.deferred {
        let _ = write!(q, "\n  {}: deferred ({})", d.experiment, d.reason);
    }
    if plan.actions.iter().any(|p| p.action.requires_confirmation) {
        q.push_str("\nSome actions call the external engine and may incur API cost.");
    }
    q
}

/// Batch repair of every flagged experiment, sequentially, behind one
/// confirmation. Halts on the first failure and reports how far it got.
pub fn repair_study(
    study: &Path,
    forced: Option<ForcedAction>,
    engine: &mut dyn ReplicationEngine,
    prompt: &mut dyn Prompt,
) -> Result<StudyRepairOutcome> {
    let pre = audit_study(study, AuditOptions::default())?;
    let mut forced = forced;
    if forced.is_none() && pre.overall.is_valid() && !pre.experiments.is_empty() && !pre.needs_compile()
    {
        forced = choose_forced_action(prompt, &format!("study {}", study.display()))?;
    }
    let plan = plan_study_repair(&pre, forced);
    let mut outcome = StudyRepairOutcome {
        status: BatchStatus::NoOp,
        plan,
        completed: Vec::new(),
        failed: None,
        not_attempted: Vec::new(),
        post: None,
    };
    if outcome.plan.actions.is_empty() && !outcome.plan.rebuild_study_aggregates {
        outcome.post = Some(pre);
        return Ok(outcome);
    }

    if !outcome.plan.actions.is_empty() {
        if !prompt.confirm(&batch_question(study, &outcome.plan))? {
            outcome.status = BatchStatus::Aborted;
            return Ok(outcome);
        }
        if outcome
            .plan
            .actions
            .iter()
            .any(|p| p.action.needs_second_confirmation())
        {
            let q = "Confirm again: forced full repair permanently deletes response data in every listed experiment.";
            if !prompt.confirm(q)? {
                outcome.status = BatchStatus::Aborted;
                return Ok(outcome);
            }
        }
    }

    let planned = outcome.plan.actions.clone();
    for (i, p) in planned.iter().enumerate() {
        let Some(exp) = pre.experiments.iter().find(|e| e.name == p.experiment) else {
            continue;
        };
        // The batch gate above already covered every confirmation.
        let result = execute(&p.action, &exp.outcome, &p.path, engine, &mut AssumeYes, None);
        let failure = match result.and_then(|o| Ok(o.ensure_converged()?)) {
            Ok(()) => None,
            Err(e) => Some(format!("{:#}", e)),
        };
        match failure {
            None => outcome.completed.push(p.experiment.clone()),
            Some(reason) => {
                warn!(experiment = %p.experiment, %reason, "batch repair halted");
                outcome.failed = Some(ExperimentNote {
                    experiment: p.experiment.clone(),
                    reason,
                });
                outcome.not_attempted = planned[i + 1..]
                    .iter()
                    .map(|p| p.experiment.clone())
                    .collect();
                outcome.status = BatchStatus::Halted;
                break;
            }
        }
    }

    if outcome.status != BatchStatus::Halted {
        outcome.status = BatchStatus::Completed;
        if outcome.plan.rebuild_study_aggregates {
            let mid = audit_study(study, AuditOptions::default())?;
            if mid.all_experiments_valid() {
                compile_from_audit(&mid)?;
            }
        }
    }
    outcome.post = Some(audit_study(
        study,
        AuditOptions {
            verbose: false,
            write_log: true,
        },
    )?);
    Ok(outcome)
}

#[derive(Debug, Clone, Serialize)]
pub struct StudyMigrationOutcome {
    pub status: BatchStatus,
    pub migrated: Vec<String>,
    pub failed: Option<ExperimentNote>,
    pub not_attempted: Vec<String>,
    #[serde(skip)]
    pub post: Option<StudyAudit>,
}

/// Migrates every experiment that needs it. Refused while any experiment
/// still needs ordinary repair, so structure is never upgraded over data that
/// is about to be regenerated.
pub fn migrate_study(
    study: &Path,
    global_config: Option<&Path>,
    prompt: &mut dyn Prompt,
) -> Result<StudyMigrationOutcome> {
    let pre = audit_study(study, AuditOptions::default())?;
    let needing_repair = pre.names_with(Verdict::NeedsRepair);
    if !needing_repair.is_empty() {
        return Err(LabError::Refused(format!(
            "repair these experiments before migrating: {}",
            needing_repair.join(", ")
        ))
        .into());
    }
    let candidates: Vec<&ExperimentAudit> = pre
        .experiments
        .iter()
        .filter(|e| e.outcome.verdict == Verdict::NeedsMigration)
        .collect();
    let mut outcome = StudyMigrationOutcome {
        status: BatchStatus::NoOp,
        migrated: Vec::new(),
        failed: None,
        not_attempted: Vec::new(),
        post: None,
    };
    if candidates.is_empty() {
        outcome.post = Some(pre);
        return Ok(outcome);
    }

    let mut question = format!("Migrate {} experiment(s) in {}?", candidates.len(), study.display());
    for e in &candidates {
        let plan = plan_migration(&e.path, global_config)?;
        if !plan.is_executable() {
            return Err(LabError::Migration(format!(
                "{}: {}",
                e.name,
                plan.blockers.join("; ")
            ))
            .into());
        }
        for step in &plan.steps {
            let _ = write!(question, "\n  {}: {}", e.name, step.describe());
        }
    }
    if !prompt.confirm(&question)? {
        outcome.status = BatchStatus::Aborted;
        return Ok(outcome);
    }

    outcome.status = BatchStatus::Completed;
    for (i, e) in candidates.iter().enumerate() {
        let failure = match migrate_experiment(&e.path, global_config, &mut AssumeYes) {
            Ok(m) if m.status == MigrationStatus::Migrated || m.status == MigrationStatus::NothingToDo => None,
            Ok(m) => Some(format!("migration {:?}", m.status)),
            Err(err) => Some(format!("{:#}", err)),
        };
        match failure {
            None => outcome.migrated.push(e.name.clone()),
            Some(reason) => {
                warn!(experiment = %e.name, %reason, "batch migration halted");
                outcome.failed = Some(ExperimentNote {
                    experiment: e.name.clone(),
                    reason,
                });
                outcome.not_attempted = candidates[i + 1..].iter().map(|e| e.name.clone()).collect();
                outcome.status = BatchStatus::Halted;
                break;
            }
        }
    }
    outcome.post = Some(audit_study(
        study,
        AuditOptions {
            verbose: false,
            write_log: true,
        },
    )?);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn verdict_strategy() -> impl Strategy<Value = Verdict> {
        prop_oneof![
            Just(Verdict::AllValid),
            Just(Verdict::NeedsAggregation),
            Just(Verdict::NeedsReprocess),
            Just(Verdict::NeedsRepair),
            Just(Verdict::NeedsMigration),
        ]
    }

    proptest! {
        #[test]
        fn overall_is_never_less_severe_than_any_child(verdicts in prop::collection::vec(verdict_strategy(), 1..12)) {
            let overall = Verdict::worst(verdicts.iter().copied());
            prop_assert!(verdicts.iter().all(|v| *v <= overall));
            prop_assert!(verdicts.contains(&overall));
        }
    }

    #[test]
    fn discovery_skips_non_experiment_directories_and_sorts_naturally() {
        let tmp = tempfile::tempdir().expect("tmp");
        for name in ["exp_10", "exp_2", "notes"] {
            std::fs::create_dir_all(tmp.path().join(name)).expect("dir");
        }
        std::fs::write(tmp.path().join("exp_10").join(layout::CONFIG_SNAPSHOT), "").expect("snap");
        std::fs::create_dir_all(tmp.path().join("exp_2").join("run_1")).expect("legacy");
        let found: Vec<String> = discover_experiments(tmp.path())
            .expect("discover")
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert_eq!(found, vec!["exp_2".to_string(), "exp_10".to_string()]);
    }
}
