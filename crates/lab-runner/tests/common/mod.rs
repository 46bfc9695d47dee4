#![allow(dead_code)]

use std::fs;
use std::path::Path;

use anyhow::{bail, Result};
use lab_analysis::extract_report;
use lab_core::layout;
use lab_runner::{
    repair_experiment, AssumeYes, ReplicationEngine, ReplicationRequest, RepairRequest,
    RepairStatus,
};

pub const BASE_SEED: u64 = 100;

/// Stand-in for the paid replication engine: writes deterministic
/// query/response files and records every call.
#[derive(Debug, Default)]
pub struct FakeEngine {
    /// `(experiment directory name, replication)` per call, in call order.
    pub calls: Vec<(String, u32)>,
    pub fail_experiment: Option<String>,
}

impl FakeEngine {
    pub fn failing_in(experiment: &str) -> Self {
        FakeEngine {
            fail_experiment: Some(experiment.to_string()),
            ..Default::default()
        }
    }

    pub fn replications(&self) -> Vec<u32> {
        self.calls.iter().map(|(_, r)| *r).collect()
    }
}

pub fn response_text(seed: u64, trial: u32) -> String {
    format!("The model answered.\nscore: {}\n", seed * 10 + u64::from(trial))
}

impl ReplicationEngine for FakeEngine {
    fn run_replication(&mut self, request: &ReplicationRequest<'_>) -> Result<()> {
        let name = request
            .experiment_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        self.calls.push((name.clone(), request.replication));
        if self.fail_experiment.as_deref() == Some(name.as_str()) {
            bail!("simulated engine failure in {}", name);
        }
        for trial in 1..=request.trials {
            fs::write(
                request.replication_dir.join(layout::query_file_name(trial)),
                format!("query seed={} trial={}\n", request.seed, trial),
            )?;
            fs::write(
                request.replication_dir.join(layout::response_file_name(trial)),
                response_text(request.seed, trial),
            )?;
        }
        Ok(())
    }
}

pub fn snapshot_text(replications: u32, trials: u32) -> String {
    format!(
        "[Study]\nschema_version = 2\nnum_replications = {}\nnum_trials = {}\nbase_seed = {}\n\n[Engine]\ncommand = fake-engine\n",
        replications, trials, BASE_SEED
    )
}

/// Experiment holding only its snapshot, as after `lab new`.
pub fn new_experiment(dir: &Path, replications: u32, trials: u32) {
    fs::create_dir_all(dir).expect("experiment dir");
    fs::write(
        dir.join(layout::CONFIG_SNAPSHOT),
        snapshot_text(replications, trials),
    )
    .expect("snapshot");
}

/// Fully populated, audited-valid experiment.
pub fn complete_experiment(dir: &Path, replications: u32, trials: u32) {
    new_experiment(dir, replications, trials);
    let mut engine = FakeEngine::default();
    let outcome = repair_experiment(dir, &RepairRequest::default(), &mut engine, &mut AssumeYes)
        .expect("initial run");
    assert_eq!(outcome.status, RepairStatus::Converged, "{}", outcome.log_text);
}

/// Experiment in the pre-versioning layout: `run_<n>` directories with a
/// `report.txt` each and a snapshot without a schema version.
pub fn legacy_experiment(dir: &Path, replications: u32, trials: u32) {
    fs::create_dir_all(dir).expect("experiment dir");
    fs::write(
        dir.join(layout::CONFIG_SNAPSHOT),
        format!(
            "[Study]\nnum_replications = {}\nnum_trials = {}\nbase_seed = {}\n",
            replications, trials, BASE_SEED
        ),
    )
    .expect("snapshot");
    for index in 1..=replications {
        let run = dir.join(format!("run_{}", index));
        fs::create_dir_all(&run).expect("run dir");
        let seed = BASE_SEED + u64::from(index);
        let mut responses = Vec::new();
        for trial in 1..=trials {
            fs::write(run.join(layout::query_file_name(trial)), "query\n").expect("query");
            let body = response_text(seed, trial);
            fs::write(run.join(layout::response_file_name(trial)), &body).expect("response");
            responses.push((trial, body.into_bytes()));
        }
        let report = extract_report(index, seed, &responses);
        fs::write(run.join(layout::LEGACY_REPORT), report.render()).expect("report");
    }
}

pub fn replication_dir(experiment: &Path, index: u32) -> std::path::PathBuf {
    experiment.join(layout::replication_dir_name(index))
}
