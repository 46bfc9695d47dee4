//! Boundary to the external replication engine, the process that generates
//! queries, performs the paid LLM calls and writes response files.

use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{anyhow, Result};
use lab_core::{layout, ConfigSnapshot, LabError};
use tracing::info;

/// Everything the engine needs to (re)generate one replication. All
/// parameters come from the experiment's snapshot, never the global config.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationRequest<'a> {
    pub experiment_dir: &'a Path,
    pub replication_dir: &'a Path,
    pub replication: u32,
    pub seed: u64,
    pub trials: u32,
    pub snapshot: &'a ConfigSnapshot,
}

pub trait ReplicationEngine {
    /// Populates `request.replication_dir` with query and response files.
    /// A report written by the engine is accepted but not required.
    fn run_replication(&mut self, request: &ReplicationRequest<'_>) -> Result<()>;
}

/// Runs the `[Engine] command` from the snapshot once per replication with the
/// replication parameters appended as flags. Output is passed through so the
/// operator can watch progress and cost.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandEngine;

impl CommandEngine {
    pub fn build_command(request: &ReplicationRequest<'_>) -> Result<Command> {
        let parts = request.snapshot.engine_command.as_ref().ok_or_else(|| {
            anyhow!(
                "{} has no [Engine] command; cannot regenerate replication data",
                layout::CONFIG_SNAPSHOT
            )
        })?;
        let mut cmd = Command::new(&parts[0]);
        cmd.args(&parts[1..])
            .arg("--experiment-dir")
            .arg(request.experiment_dir)
            .arg("--replication")
            .arg(request.replication.to_string())
            .arg("--seed")
            .arg(request.seed.to_string())
            .arg("--trials")
            .arg(request.trials.to_string())
            .arg("--config")
            .arg(ConfigSnapshot::path_in(request.experiment_dir))
            .env("LAB_REPLICATION_DIR", request.replication_dir);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        Ok(cmd)
    }
}

impl ReplicationEngine for CommandEngine {
    fn run_replication(&mut self, request: &ReplicationRequest<'_>) -> Result<()> {
        let mut cmd = Self::build_command(request)?;
        info!(
            replication = request.replication,
            seed = request.seed,
            "invoking replication engine"
        );
        let status = cmd.status().map_err(|e| {
            LabError::Execution(format!(
                "could not start engine for replication {}: {}",
                request.replication, e
            ))
        })?;
        if !status.success() {
            let code = status
                .code()
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(LabError::Execution(format!(
                "engine exited with status {} for replication {}",
                code, request.replication
            ))
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(command: Option<&str>) -> ConfigSnapshot {
        let mut text = "[Study]\nschema_version = 2\nnum_replications = 2\nnum_trials = 3\nbase_seed = 7\n"
            .to_string();
        if let Some(c) = command {
            text.push_str(&format!("[Engine]\ncommand = {}\n", c));
        }
        ConfigSnapshot::from_ini_str(&text, Path::new("config_snapshot.ini")).expect("snapshot")
    }

    #[test]
    fn build_command_appends_replication_flags() {
        let snap = snapshot(Some("python3 run.py --fast"));
        let exp = Path::new("/data/study/exp_1");
        let rep_dir = exp.join("replication_002");
        let request = ReplicationRequest {
            experiment_dir: exp,
            replication_dir: &rep_dir,
            replication: 2,
            seed: snap.seed_for(2),
            trials: snap.num_trials,
            snapshot: &snap,
        };
        let cmd = CommandEngine::build_command(&request).expect("command");
        assert_eq!(cmd.get_program(), "python3");
        let args: Vec<String> = cmd
            .get_args()
            .map(|a| a.to_string_lossy().to_string())
            .collect();
        assert_eq!(
            args,
            vec![
                "run.py",
                "--fast",
                "--experiment-dir",
                "/data/study/exp_1",
                "--replication",
                "2",
                "--seed",
                "9",
                "--trials",
                "3",
                "--config",
                "/data/study/exp_1/config_snapshot.ini",
            ]
        );
    }

    #[test]
    fn missing_engine_command_is_an_error() {
        let snap = snapshot(None);
        let exp = Path::new("exp");
        let request = ReplicationRequest {
            experiment_dir: exp,
            replication_dir: exp,
            replication: 1,
            seed: 8,
            trials: 3,
            snapshot: &snap,
        };
        assert!(CommandEngine::build_command(&request).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_engine_exit_is_an_execution_failure() {
        let snap = snapshot(Some("false"));
        let tmp = tempfile::tempdir().expect("tmp");
        let request = ReplicationRequest {
            experiment_dir: tmp.path(),
            replication_dir: tmp.path(),
            replication: 1,
            seed: 8,
            trials: 3,
            snapshot: &snap,
        };
        let err = CommandEngine.run_replication(&request).expect_err("must fail");
        assert!(matches!(
            err.downcast_ref::<LabError>(),
            Some(LabError::Execution(_))
        ));
    }
}
