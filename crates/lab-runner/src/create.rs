use std::fs;
use std::path::Path;

use anyhow::Result;
use lab_core::snapshot::load_global_config;
use lab_core::{ensure_dir, ConfigSnapshot, LabError, SnapshotOverrides};
use tracing::info;

/// Creates a new experiment directory holding only its config snapshot,
/// captured from the global config at `global_config`. This is the single
/// place the global config is read for an experiment's lifetime.
pub fn create_experiment(
    experiment: &Path,
    global_config: &Path,
    overrides: SnapshotOverrides,
) -> Result<ConfigSnapshot> {
    if experiment.exists() {
        let occupied = fs::read_dir(experiment)
            .map_err(|e| LabError::io(experiment, e))?
            .next()
            .is_some();
        if occupied {
            return Err(LabError::Refused(format!(
                "{} already exists and is not empty",
                experiment.display()
            ))
            .into());
        }
    }
    let global = load_global_config(global_config)?;
    let snapshot = ConfigSnapshot::capture(&global, overrides, global_config)?;
    ensure_dir(experiment)?;
    snapshot.write_to(experiment)?;
    info!(
        experiment = %experiment.display(),
        replications = snapshot.num_replications,
        trials = snapshot.num_trials,
        "experiment created"
    );
    Ok(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{audit, AuditOptions, Lifecycle};
    use lab_core::Verdict;

    #[test]
    fn new_experiment_audits_as_needing_its_replications() {
        let tmp = tempfile::tempdir().expect("tmp");
        let global = tmp.path().join("global.ini");
        fs::write(
            &global,
            "[Study]\nnum_replications = 3\nnum_trials = 2\n[Engine]\ncommand = run-engine\n",
        )
        .expect("global");
        let exp = tmp.path().join("exp_1");
        let snap = create_experiment(
            &exp,
            &global,
            SnapshotOverrides {
                replications: Some(4),
                trials: None,
            },
        )
        .expect("create");
        assert_eq!(snap.num_replications, 4);
        assert!(snap.is_current());

        let outcome = audit(&exp, AuditOptions::default()).expect("audit");
        assert_eq!(outcome.verdict, Verdict::NeedsRepair);
        assert_eq!(outcome.lifecycle, Lifecycle::New);
        assert_eq!(outcome.replications.len(), 4);

        let err = create_experiment(&exp, &global, SnapshotOverrides::default())
            .expect_err("second create must refuse");
        assert!(err.to_string().contains("not empty"));
    }
}
