//! Structural upgrade of experiments written under older layouts.
//!
//! Migration only fixes structure: directory and report names, and the config
//! snapshot. Missing data found afterwards is left for the ordinary repair
//! path.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Result;
use lab_core::layout;
use lab_core::snapshot::load_global_config;
use lab_core::{ConfigSnapshot, LabError, SnapshotOverrides};
use serde::Serialize;
use tracing::info;

use crate::audit::{audit, AuditOptions, AuditOutcome};
use crate::inventory::{self, StructuralIssue};
use crate::prompt::Prompt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum MigrationStep {
    RenameDirectory { from: String, to: String },
    /// Rename `report.txt` inside the (already renamed) replication directory.
    RenameReport { dir: String, to: String },
    CaptureSnapshot { source: PathBuf },
    UpgradeSchema { from: u32 },
}

impl MigrationStep {
    pub fn describe(&self) -> String {
        match self {
            MigrationStep::RenameDirectory { from, to } => format!("rename {} -> {}", from, to),
            MigrationStep::RenameReport { dir, to } => {
                format!("rename {}/{} -> {}", dir, layout::LEGACY_REPORT, to)
            }
            MigrationStep::CaptureSnapshot { source } => format!(
                "write {} from {}",
                layout::CONFIG_SNAPSHOT,
                source.display()
            ),
            MigrationStep::UpgradeSchema { from } => format!(
                "upgrade snapshot schema {} -> {}",
                from,
                lab_core::CURRENT_SCHEMA_VERSION
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MigrationPlan {
    pub experiment: PathBuf,
    pub steps: Vec<MigrationStep>,
    /// Problems that cannot be fixed automatically; a plan with blockers is
    /// never executed.
    pub blockers: Vec<String>,
}

impl MigrationPlan {
    pub fn is_executable(&self) -> bool {
        self.blockers.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    NothingToDo,
    Migrated,
    Aborted,
    Blocked,
}

#[derive(Debug, Clone)]
pub struct MigrationOutcome {
    pub plan: MigrationPlan,
    pub status: MigrationStatus,
    pub post: Option<AuditOutcome>,
}

pub fn plan_migration(experiment: &Path, global_config: Option<&Path>) -> Result<MigrationPlan> {
    let inv = inventory::scan(experiment)?;
    let mut steps = Vec::new();
    let mut blockers = Vec::new();

    let mut replications = inv.snapshot.as_ref().map(|s| s.num_replications);
    for issue in &inv.structural {
        match issue {
            StructuralIssue::SnapshotMissing => match global_config {
                Some(source) => {
                    let global = load_global_config(source)?;
                    let captured =
                        ConfigSnapshot::capture(&global, SnapshotOverrides::default(), source)?;
                    replications = Some(captured.num_replications);
                    steps.push(MigrationStep::CaptureSnapshot {
                        source: source.to_path_buf(),
                    });
                }
                None => blockers.push(format!(
                    "{} is missing; pass a global config to capture one",
                    layout::CONFIG_SNAPSHOT
                )),
            },
            StructuralIssue::SnapshotInvalid { message } => blockers.push(format!(
                "{} must be fixed by hand: {}",
                layout::CONFIG_SNAPSHOT,
                message
            )),
            StructuralIssue::SchemaOutdated { found, .. } => {
                steps.push(MigrationStep::UpgradeSchema { from: *found })
            }
            _ => {}
        }
    }
    let limit = replications.unwrap_or(inv.expected_replications);

    let mut targets: BTreeMap<u32, Vec<String>> = BTreeMap::new();
    for name in &inv.found_dirs {
        let kind = layout::classify_dir_name(name);
        let Some(index) = kind.index() else { continue };
        targets.entry(index).or_default().push(name.clone());
        if index == 0 || index > limit {
            blockers.push(format!("{} has index {} outside 1..={}", name, index, limit));
        }
    }
    for (index, sources) in &targets {
        let target = layout::replication_dir_name(*index);
        if sources.len() > 1 {
            blockers.push(format!(
                "{} map to the same replication {}",
                sources.join(", "),
                target
            ));
            continue;
        }
        let source = &sources[0];
        if layout::classify_dir_name(source).is_legacy() {
            steps.push(MigrationStep::RenameDirectory {
                from: source.clone(),
                to: target.clone(),
            });
        }
        let dir = experiment.join(source);
        if dir.join(layout::LEGACY_REPORT).exists() {
            let report = layout::report_file_name(*index);
            if dir.join(&report).exists() {
                blockers.push(format!(
                    "{} holds both {} and {}",
                    source,
                    layout::LEGACY_REPORT,
                    report
                ));
            } else {
                steps.push(MigrationStep::RenameReport {
                    dir: target,
                    to: report,
                });
            }
        }
    }

    Ok(MigrationPlan {
        experiment: experiment.to_path_buf(),
        steps,
        blockers,
    })
}

fn rename(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| LabError::io(from, e))?;
    Ok(())
}

fn apply_step(experiment: &Path, step: &MigrationStep) -> Result<()> {
    match step {
        MigrationStep::RenameDirectory { from, to } => {
            rename(&experiment.join(from), &experiment.join(to))
        }
        MigrationStep::RenameReport { dir, to } => {
            let dir = experiment.join(dir);
            rename(&dir.join(layout::LEGACY_REPORT), &dir.join(to))
        }
        MigrationStep::CaptureSnapshot { source } => {
            let global = load_global_config(source)?;
            let snapshot = ConfigSnapshot::capture(&global, SnapshotOverrides::default(), source)?;
            snapshot.write_to(experiment)?;
            Ok(())
        }
        MigrationStep::UpgradeSchema { .. } => {
            let snapshot = ConfigSnapshot::load(experiment)?;
            snapshot.upgraded().write_to(experiment)?;
            Ok(())
        }
    }
}

/// Plans, confirms and applies a migration, then re-audits. The post-audit
/// verdict may still call for repair; migration does not regenerate data.
pub fn migrate_experiment(
    experiment: &Path,
    global_config: Option<&Path>,
    prompt: &mut dyn Prompt,
) -> Result<MigrationOutcome> {
    let plan = plan_migration(experiment, global_config)?;
    if !plan.is_executable() {
        return Ok(MigrationOutcome {
            plan,
            status: MigrationStatus::Blocked,
            post: None,
        });
    }
    if plan.steps.is_empty() {
        let post = audit(experiment, AuditOptions::default())?;
        return Ok(MigrationOutcome {
            plan,
            status: MigrationStatus::NothingToDo,
            post: Some(post),
        });
    }
    let listing: Vec<String> = plan.steps.iter().map(MigrationStep::describe).collect();
    let question = format!(
        "Migrate {}? Steps:\n  {}",
        experiment.display(),
        listing.join("\n  ")
    );
    if !prompt.confirm(&question)? {
        return Ok(MigrationOutcome {
            plan,
            status: MigrationStatus::Aborted,
            post: None,
        });
    }
    for step in &plan.steps {
        info!(experiment = %experiment.display(), step = %step.describe(), "migration step");
        apply_step(experiment, step)?;
    }
    let post = audit(experiment, AuditOptions::default())?;
    Ok(MigrationOutcome {
        plan,
        status: MigrationStatus::Migrated,
        post: Some(post),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::{Answer, ScriptedPrompt};

    const SNAPSHOT_V1: &str = "[Study]\nnum_replications = 2\nnum_trials = 1\n";

    #[test]
    fn plans_renames_and_schema_upgrade() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(tmp.path().join(layout::CONFIG_SNAPSHOT), SNAPSHOT_V1).expect("snap");
        fs::create_dir_all(tmp.path().join("run_1")).expect("run_1");
        fs::write(tmp.path().join("run_1").join("report.txt"), "r").expect("report");
        fs::create_dir_all(tmp.path().join("replication_002")).expect("rep2");

        let plan = plan_migration(tmp.path(), None).expect("plan");
        assert!(plan.is_executable(), "{:?}", plan.blockers);
        assert_eq!(
            plan.steps,
            vec![
                MigrationStep::UpgradeSchema { from: 1 },
                MigrationStep::RenameDirectory {
                    from: "run_1".into(),
                    to: "replication_001".into()
                },
                MigrationStep::RenameReport {
                    dir: "replication_001".into(),
                    to: "report_001.txt".into()
                },
            ]
        );
    }

    #[test]
    fn colliding_directories_block_the_plan() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::write(
            tmp.path().join(layout::CONFIG_SNAPSHOT),
            "[Study]\nschema_version = 2\nnum_replications = 2\nnum_trials = 1\n",
        )
        .expect("snap");
        for name in ["run_1", "replication_001"] {
            fs::create_dir_all(tmp.path().join(name)).expect("dir");
        }
        let mut prompt = ScriptedPrompt::new([Answer::Yes]);
        let outcome = migrate_experiment(tmp.path(), None, &mut prompt).expect("migrate");
        assert_eq!(outcome.status, MigrationStatus::Blocked);
        assert!(prompt.asked.is_empty());
        assert!(tmp.path().join("run_1").is_dir());
    }

    #[test]
    fn missing_snapshot_without_global_config_is_a_blocker() {
        let tmp = tempfile::tempdir().expect("tmp");
        fs::create_dir_all(tmp.path().join("run_1")).expect("dir");
        let plan = plan_migration(tmp.path(), None).expect("plan");
        assert!(!plan.is_executable());
    }
}
