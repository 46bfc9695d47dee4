//! Executes a selected action against one experiment directory and confirms
//! the result with a fresh audit.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use lab_analysis::{extract_report, render_batch_log, render_experiment_results};
use lab_core::{atomic_write_bytes, ensure_dir, layout, ConfigSnapshot, LabError, Verdict};
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{audit, AuditOptions, AuditOutcome, ReplicationHealth};
use crate::engine::{ReplicationEngine, ReplicationRequest};
use crate::inventory;
use crate::prompt::{choose_forced_action, Prompt};
use crate::select::{select_action, ActionKind, ForcedAction, RepairAction, RepairScope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairStatus {
    /// Nothing needed doing.
    NoOp,
    Converged,
    /// Every replication inside the requested range is valid, but
    /// replications outside it still need work.
    ConvergedInScope,
    /// Structural problems; the migration workflow has to run first.
    Halted,
    Aborted,
    NotConverged,
    /// The experiment needs work but none of it falls inside the requested
    /// replication range.
    OutOfScope,
}

impl RepairStatus {
    pub fn is_success(self) -> bool {
        matches!(
            self,
            RepairStatus::NoOp | RepairStatus::Converged | RepairStatus::ConvergedInScope
        )
    }
}

#[derive(Debug, Clone, Default)]
pub struct RepairRequest {
    pub scope: RepairScope,
    pub forced: Option<ForcedAction>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RepairOutcome {
    pub action: RepairAction,
    pub status: RepairStatus,
    pub pre_verdict: Verdict,
    /// Re-audit after the action; `None` only when the operator aborted.
    pub post: Option<AuditOutcome>,
    /// Engine or local rebuild failure that cut the action short.
    pub error: Option<String>,
    pub log_text: String,
}

impl RepairOutcome {
    pub fn post_verdict(&self) -> Verdict {
        self.post.as_ref().map_or(self.pre_verdict, |p| p.verdict)
    }

    /// Turns a `NotConverged` or `OutOfScope` outcome into a
    /// [`LabError::Convergence`].
    pub fn ensure_converged(&self) -> lab_core::Result<()> {
        if !matches!(self.status, RepairStatus::NotConverged | RepairStatus::OutOfScope) {
            return Ok(());
        }
        let mut message = format!("post-repair verdict {} after {}", self.post_verdict(), self.action);
        if let Some(e) = &self.error {
            message = format!("{}; {}", e, message);
        }
        Err(LabError::Convergence(message))
    }
}

/// Regenerates `report_NNN.txt` from the replication's response files.
pub fn rebuild_report(experiment: &Path, snapshot: &ConfigSnapshot, index: u32) -> Result<()> {
    let dir = experiment.join(layout::replication_dir_name(index));
    let mut responses = Vec::with_capacity(snapshot.num_trials as usize);
    for trial in 1..=snapshot.num_trials {
        let path = dir.join(layout::response_file_name(trial));
        let bytes = fs::read(&path).map_err(|e| LabError::io(&path, e))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(anyhow!(
                "cannot build report for replication {}: {} is empty",
                index,
                path.display()
            ));
        }
        responses.push((trial, bytes));
    }
    let report = extract_report(index, snapshot.seed_for(index), &responses);
    atomic_write_bytes(
        &dir.join(layout::report_file_name(index)),
        report.render().as_bytes(),
    )?;
    Ok(())
}

/// Rewrites both experiment aggregates from the current reports. Every
/// replication must have a fresh report.
pub fn rebuild_aggregates(experiment: &Path) -> Result<()> {
    let inv = inventory::scan(experiment)?;
    let entries = inv.fresh_reports().ok_or_else(|| {
        anyhow!(
            "cannot aggregate {}: not every replication has a fresh report",
            experiment.display()
        )
    })?;
    let results = render_experiment_results(&entries).context("render results table")?;
    let batch_log = render_batch_log(&entries).context("render batch log")?;
    atomic_write_bytes(&experiment.join(layout::EXPERIMENT_RESULTS), &results)?;
    atomic_write_bytes(&experiment.join(layout::BATCH_RUN_LOG), &batch_log)?;
    Ok(())
}

/// Regenerates every in-scope report whose raw data is complete but whose
/// report is not fresh, then the aggregates when every replication is valid.
fn finish_locally(experiment: &Path, snapshot: &ConfigSnapshot, scope: RepairScope) -> Result<()> {
    let outcome = audit(experiment, AuditOptions::default())?;
    for index in outcome
        .replications_with(ReplicationHealth::NeedsReprocess)
        .into_iter()
        .filter(|i| scope.contains(*i))
    {
        rebuild_report(experiment, snapshot, index)?;
    }
    let outcome = audit(experiment, AuditOptions::default())?;
    if outcome
        .replications
        .iter()
        .all(|r| r.health == ReplicationHealth::Valid)
    {
        rebuild_aggregates(experiment)?;
    }
    Ok(())
}

fn run_repair(
    experiment: &Path,
    snapshot: &ConfigSnapshot,
    replications: &[u32],
    engine: &mut dyn ReplicationEngine,
) -> Result<()> {
    let mut ordered = replications.to_vec();
    ordered.sort_unstable();
    for index in ordered {
        let dir = experiment.join(layout::replication_dir_name(index));
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| LabError::io(&dir, e))?;
        }
        ensure_dir(&dir)?;
        let request = ReplicationRequest {
            experiment_dir: experiment,
            replication_dir: &dir,
            replication: index,
            seed: snapshot.seed_for(index),
            trials: snapshot.num_trials,
            snapshot,
        };
        engine
            .run_replication(&request)
            .with_context(|| format!("replication {} of {}", index, experiment.display()))?;
        info!(replication = index, "replication regenerated");
    }
    Ok(())
}

fn apply(
    action: &RepairAction,
    experiment: &Path,
    snapshot: &ConfigSnapshot,
    engine: &mut dyn ReplicationEngine,
) -> Result<()> {
    match action.kind {
        ActionKind::Repair => {
            run_repair(experiment, snapshot, &action.replications, engine)?;
            finish_locally(experiment, snapshot, action.scope)
        }
        ActionKind::Reprocess => {
            for &index in &action.replications {
                rebuild_report(experiment, snapshot, index)?;
            }
            finish_locally(experiment, snapshot, action.scope)
        }
        ActionKind::Aggregate => rebuild_aggregates(experiment),
        ActionKind::NoOp | ActionKind::Halt => Ok(()),
    }
}

fn render_log(
    experiment: &Path,
    pre: &AuditOutcome,
    action: &RepairAction,
    notes: Option<&str>,
    result: &str,
    post: &AuditOutcome,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Experiment repair: {}", experiment.display());
    let _ = writeln!(out, "Started: {}", Utc::now().to_rfc3339());
    if let Some(n) = notes {
        let _ = writeln!(out, "Notes: {}", n);
    }
    let _ = writeln!(out, "Pre-repair verdict: {}", pre.verdict);
    let _ = writeln!(out, "Action: {}", action);
    let _ = writeln!(out, "Result: {}", result);
    out.push_str("\n--- post-repair audit ---\n");
    out.push_str(&post.report_text);
    out
}

fn confirm_action(action: &RepairAction, experiment: &Path, prompt: &mut dyn Prompt) -> Result<bool> {
    if action.requires_confirmation {
        let mut question = format!(
            "Re-run replications {:?} of {}? This calls the external engine and may incur API cost.",
            action.replications,
            experiment.display()
        );
        if action.destructive {
            question.push_str(" Existing files in those replications will be deleted.");
        }
        if !prompt.confirm(&question)? {
            return Ok(false);
        }
    }
    if action.needs_second_confirmation() {
        let question = format!(
            "Confirm again: permanently delete response data for replications {:?}?",
            action.replications
        );
        if !prompt.confirm(&question)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Performs `action` on the experiment audited as `pre`. Confirmation is asked
/// before anything is written, so an abort leaves the directory untouched.
/// An engine or rebuild failure still ends with a re-audit: the outcome is
/// `NotConverged` with `error` set.
pub fn execute(
    action: &RepairAction,
    pre: &AuditOutcome,
    experiment: &Path,
    engine: &mut dyn ReplicationEngine,
    prompt: &mut dyn Prompt,
    notes: Option<&str>,
) -> Result<RepairOutcome> {
    let outcome = |status: RepairStatus, post: Option<AuditOutcome>, log_text: String| RepairOutcome {
        action: action.clone(),
        status,
        pre_verdict: pre.verdict,
        post,
        error: None,
        log_text,
    };

    if action.kind == ActionKind::NoOp {
        let status = if pre.verdict.is_valid() {
            RepairStatus::NoOp
        } else {
            warn!(experiment = %experiment.display(), verdict = %pre.verdict, "nothing to repair inside the requested range");
            RepairStatus::OutOfScope
        };
        return Ok(outcome(status, Some(pre.clone()), String::new()));
    }
    if action.kind == ActionKind::Halt {
        warn!(experiment = %experiment.display(), "repair refused: migration required");
        let log = render_log(experiment, pre, action, notes, "refused; run lab migrate", pre);
        atomic_write_bytes(&experiment.join(layout::REPAIR_LOG), log.as_bytes())?;
        return Ok(outcome(RepairStatus::Halted, Some(pre.clone()), log));
    }
    if !confirm_action(action, experiment, prompt)? {
        info!(experiment = %experiment.display(), "repair aborted by operator");
        return Ok(outcome(RepairStatus::Aborted, None, String::new()));
    }

    let snapshot = pre
        .inventory
        .snapshot
        .clone()
        .map(Ok)
        .unwrap_or_else(|| ConfigSnapshot::load(experiment))?;
    info!(experiment = %experiment.display(), action = %action, "executing repair");
    let applied = apply(action, experiment, &snapshot, engine);

    let post = audit(experiment, AuditOptions::default())?;
    let (status, result) = match &applied {
        Err(e) => (RepairStatus::NotConverged, format!("failed: {:#}", e)),
        Ok(()) if post.verdict == Verdict::AllValid => (RepairStatus::Converged, "converged".to_string()),
        Ok(()) if in_scope_converged(action, &post) => (
            RepairStatus::ConvergedInScope,
            "requested replications valid; others outside the range still need work".to_string(),
        ),
        Ok(()) => (
            RepairStatus::NotConverged,
            format!("did not converge (post-repair verdict {})", post.verdict),
        ),
    };
    let log = render_log(experiment, pre, action, notes, &result, &post);
    atomic_write_bytes(&experiment.join(layout::REPAIR_LOG), log.as_bytes())?;

    if status == RepairStatus::NotConverged {
        warn!(experiment = %experiment.display(), verdict = %post.verdict, %result, "repair did not converge");
    }
    let mut done = outcome(status, Some(post), log);
    done.error = applied.err().map(|e| format!("{:#}", e));
    Ok(done)
}

fn in_scope_converged(action: &RepairAction, post: &AuditOutcome) -> bool {
    post.verdict != Verdict::NeedsMigration
        && !action.replications.is_empty()
        && action
            .replications
            .iter()
            .all(|i| post.health_of(*i) == Some(ReplicationHealth::Valid))
}

/// Audit, select and execute in one step: the `lab repair` workflow. When the
/// experiment is already valid and no action is forced, the operator is
/// offered the forced-action menu.
pub fn repair_experiment(
    experiment: &Path,
    request: &RepairRequest,
    engine: &mut dyn ReplicationEngine,
    prompt: &mut dyn Prompt,
) -> Result<RepairOutcome> {
    let pre = audit(experiment, AuditOptions::default())?;
    let mut forced = request.forced;
    if pre.verdict == Verdict::AllValid && forced.is_none() {
        forced = choose_forced_action(prompt, &experiment.display().to_string())?;
    }
    let action = select_action(&pre, request.scope, forced);
    execute(
        &action,
        &pre,
        experiment,
        engine,
        prompt,
        request.notes.as_deref(),
    )
}
