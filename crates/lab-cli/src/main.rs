use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use lab_core::{LabError, SnapshotOverrides, Verdict};
use lab_runner::{
    AssumeYes, AuditOptions, BatchStatus, CommandEngine, ForcedAction, MigrationStatus, Prompt,
    RepairRequest, RepairScope, RepairStatus,
};
use serde_json::{json, Value};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

const EXIT_ERROR: i32 = 5;
const EXIT_ABORTED: i32 = 99;
const EXIT_FAILED: i32 = 1;

#[derive(Parser)]
#[command(name = "lab", version, about = "Audit, repair and migrate experiment directories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ForceArg {
    #[value(name = "full")]
    Full,
    #[value(name = "reprocess")]
    Reprocess,
    #[value(name = "aggregate")]
    Aggregate,
}

impl From<ForceArg> for ForcedAction {
    fn from(value: ForceArg) -> Self {
        match value {
            ForceArg::Full => ForcedAction::FullRepair,
            ForceArg::Reprocess => ForcedAction::Reprocess,
            ForceArg::Aggregate => ForcedAction::Aggregate,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create an experiment directory holding a snapshot of the global config.
    New {
        experiment: PathBuf,
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        replications: Option<u32>,
        #[arg(long)]
        trials: Option<u32>,
        #[arg(long)]
        json: bool,
    },
    Audit {
        experiment: PathBuf,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    Repair {
        experiment: PathBuf,
        #[arg(long)]
        start: Option<u32>,
        #[arg(long)]
        end: Option<u32>,
        #[arg(long)]
        notes: Option<String>,
        /// Answer every confirmation with yes.
        #[arg(long)]
        yes: bool,
        #[arg(long, value_enum)]
        force: Option<ForceArg>,
        #[arg(long)]
        json: bool,
    },
    AuditStudy {
        study: PathBuf,
        #[arg(long)]
        verbose: bool,
        #[arg(long)]
        json: bool,
    },
    RepairStudy {
        study: PathBuf,
        #[arg(long)]
        yes: bool,
        #[arg(long, value_enum)]
        force: Option<ForceArg>,
        #[arg(long)]
        json: bool,
    },
    Migrate {
        experiment: PathBuf,
        /// Global config used when the snapshot is missing.
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    MigrateStudy {
        study: PathBuf,
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
    /// Rebuild the study-level results table and batch log.
    CompileStudy {
        study: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

struct Reply {
    payload: Option<Value>,
    code: i32,
}

impl Reply {
    fn json(json: bool, payload: Value, code: i32) -> Self {
        Reply {
            payload: json.then_some(payload),
            code,
        }
    }
}

fn main() {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let code = match run_command(cli.command) {
        Ok(reply) => {
            if let Some(payload) = reply.payload {
                emit_json(&payload);
            }
            reply.code
        }
        Err(err) => {
            if json_mode {
                emit_json(&json_error(error_code(&err), format!("{:#}", err), json!({})));
            } else {
                eprintln!("error: {:#}", err);
            }
            EXIT_ERROR
        }
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Reply> {
    match command {
        Commands::New {
            experiment,
            config,
            replications,
            trials,
            json,
        } => {
            let snapshot = lab_runner::create_experiment(
                &experiment,
                &config,
                SnapshotOverrides {
                    replications,
                    trials,
                },
            )?;
            if !json {
                println!(
                    "created: {} ({} replications x {} trials, schema {})",
                    experiment.display(),
                    snapshot.num_replications,
                    snapshot.num_trials,
                    snapshot.schema_version
                );
            }
            Ok(Reply::json(
                json,
                json!({
                    "ok": true,
                    "experiment": experiment.display().to_string(),
                    "replications": snapshot.num_replications,
                    "trials": snapshot.num_trials,
                    "base_seed": snapshot.base_seed,
                    "schema_version": snapshot.schema_version
                }),
                0,
            ))
        }
        Commands::Audit {
            experiment,
            verbose,
            json,
        } => {
            let outcome = lab_runner::audit(
                &experiment,
                AuditOptions {
                    verbose,
                    write_log: true,
                },
            )?;
            if !json {
                print!("{}", outcome.report_text);
            }
            let code = verdict_exit_code(outcome.verdict);
            Ok(Reply::json(
                json,
                json!({ "ok": true, "audit": serde_json::to_value(&outcome)? }),
                code,
            ))
        }
        Commands::Repair {
            experiment,
            start,
            end,
            notes,
            yes,
            force,
            json,
        } => {
            if let (Some(s), Some(e)) = (start, end) {
                if s > e {
                    return Err(anyhow::anyhow!("--start {} is after --end {}", s, e));
                }
            }
            let request = RepairRequest {
                scope: RepairScope { start, end },
                forced: force.map(Into::into),
                notes,
            };
            let mut prompt = prompt_for(yes);
            let outcome = lab_runner::repair_experiment(
                &experiment,
                &request,
                &mut CommandEngine,
                prompt.as_mut(),
            )?;
            if !json {
                println!("action: {}", outcome.action);
                println!("result: {}", repair_status_label(outcome.status));
                if let Some(e) = &outcome.error {
                    println!("error: {}", e);
                }
                if let Some(post) = &outcome.post {
                    if outcome.status != RepairStatus::NoOp {
                        print!("{}", post.report_text);
                    }
                }
            }
            let code = repair_exit_code(outcome.status);
            let payload = json!({
                "ok": outcome.status.is_success(),
                "action": serde_json::to_value(&outcome.action)?,
                "status": outcome.status,
                "pre_verdict": outcome.pre_verdict,
                "post_verdict": outcome.post_verdict(),
                "error": outcome.error
            });
            Ok(Reply::json(json, payload, code))
        }
        Commands::AuditStudy {
            study,
            verbose,
            json,
        } => {
            let audit = lab_runner::audit_study(
                &study,
                AuditOptions {
                    verbose,
                    write_log: true,
                },
            )?;
            if !json {
                print!("{}", audit.report_text);
            }
            let code = verdict_exit_code(audit.overall);
            Ok(Reply::json(
                json,
                json!({ "ok": true, "study": serde_json::to_value(&audit)? }),
                code,
            ))
        }
        Commands::RepairStudy {
            study,
            yes,
            force,
            json,
        } => {
            let mut prompt = prompt_for(yes);
            let outcome = lab_runner::repair_study(
                &study,
                force.map(Into::into),
                &mut CommandEngine,
                prompt.as_mut(),
            )?;
            let post_verdict = outcome.post.as_ref().map(|p| p.overall);
            if !json {
                print_study_repair(&outcome);
            }
            let code = match outcome.status {
                BatchStatus::Aborted => EXIT_ABORTED,
                BatchStatus::Halted => EXIT_FAILED,
                BatchStatus::NoOp | BatchStatus::Completed => {
                    post_verdict.map_or(0, verdict_exit_code)
                }
            };
            let payload = json!({
                "ok": matches!(outcome.status, BatchStatus::NoOp | BatchStatus::Completed),
                "outcome": serde_json::to_value(&outcome)?,
                "post_verdict": post_verdict
            });
            Ok(Reply::json(json, payload, code))
        }
        Commands::Migrate {
            experiment,
            config,
            yes,
            json,
        } => {
            let mut prompt = prompt_for(yes);
            let outcome =
                lab_runner::migrate_experiment(&experiment, config.as_deref(), prompt.as_mut())?;
            let post_verdict = outcome.post.as_ref().map(|p| p.verdict);
            if !json {
                for step in &outcome.plan.steps {
                    println!("step: {}", step.describe());
                }
                for blocker in &outcome.plan.blockers {
                    println!("blocked: {}", blocker);
                }
                println!("result: {:?}", outcome.status);
                if let Some(v) = post_verdict {
                    println!("post-migration verdict: {}", v);
                }
            }
            let code = match outcome.status {
                MigrationStatus::Migrated | MigrationStatus::NothingToDo => 0,
                MigrationStatus::Aborted => EXIT_ABORTED,
                MigrationStatus::Blocked => EXIT_ERROR,
            };
            let payload = json!({
                "ok": code == 0,
                "status": outcome.status,
                "plan": serde_json::to_value(&outcome.plan)?,
                "post_verdict": post_verdict
            });
            Ok(Reply::json(json, payload, code))
        }
        Commands::MigrateStudy {
            study,
            config,
            yes,
            json,
        } => {
            let mut prompt = prompt_for(yes);
            let outcome = lab_runner::migrate_study(&study, config.as_deref(), prompt.as_mut())?;
            let post_verdict = outcome.post.as_ref().map(|p| p.overall);
            if !json {
                for name in &outcome.migrated {
                    println!("migrated: {}", name);
                }
                if let Some(f) = &outcome.failed {
                    println!("failed: {}: {}", f.experiment, f.reason);
                }
                for name in &outcome.not_attempted {
                    println!("not attempted: {}", name);
                }
                println!("result: {:?}", outcome.status);
                if let Some(v) = post_verdict {
                    println!("post-migration verdict: {}", v);
                }
            }
            let code = match outcome.status {
                BatchStatus::NoOp | BatchStatus::Completed => 0,
                BatchStatus::Aborted => EXIT_ABORTED,
                BatchStatus::Halted => EXIT_FAILED,
            };
            let payload = json!({
                "ok": code == 0,
                "outcome": serde_json::to_value(&outcome)?,
                "post_verdict": post_verdict
            });
            Ok(Reply::json(json, payload, code))
        }
        Commands::CompileStudy { study, json } => {
            lab_runner::compile_study(&study)?;
            if !json {
                println!("study aggregates written: {}", study.display());
            }
            Ok(Reply::json(
                json,
                json!({ "ok": true, "study": study.display().to_string() }),
                0,
            ))
        }
    }
}

fn verdict_exit_code(verdict: Verdict) -> i32 {
    match verdict {
        Verdict::AllValid => 0,
        Verdict::NeedsReprocess => 1,
        Verdict::NeedsRepair => 2,
        Verdict::NeedsMigration => 3,
        Verdict::NeedsAggregation => 4,
    }
}

fn repair_exit_code(status: RepairStatus) -> i32 {
    match status {
        RepairStatus::NoOp | RepairStatus::Converged | RepairStatus::ConvergedInScope => 0,
        RepairStatus::Aborted => EXIT_ABORTED,
        RepairStatus::Halted => verdict_exit_code(Verdict::NeedsMigration),
        RepairStatus::NotConverged | RepairStatus::OutOfScope => EXIT_FAILED,
    }
}

fn repair_status_label(status: RepairStatus) -> &'static str {
    match status {
        RepairStatus::NoOp => "nothing to do",
        RepairStatus::Converged => "converged",
        RepairStatus::ConvergedInScope => "converged within the requested range",
        RepairStatus::Halted => "halted; run `lab migrate` first",
        RepairStatus::Aborted => "aborted",
        RepairStatus::NotConverged => "did not converge; see experiment_repair_log.txt",
        RepairStatus::OutOfScope => "nothing to repair inside the requested range; experiment still needs work",
    }
}

fn print_study_repair(outcome: &lab_runner::StudyRepairOutcome) {
    for p in &outcome.plan.actions {
        println!("planned: {}: {}", p.experiment, p.action);
    }
    for d in &outcome.plan.deferred {
        println!("deferred: {}: {}", d.experiment, d.reason);
    }
    for name in &outcome.completed {
        println!("completed: {}", name);
    }
    if let Some(f) = &outcome.failed {
        println!("failed: {}: {}", f.experiment, f.reason);
    }
    for name in &outcome.not_attempted {
        println!("not attempted: {}", name);
    }
    println!("result: {:?}", outcome.status);
    if let Some(post) = &outcome.post {
        print!("{}", post.report_text);
    }
}

fn prompt_for(yes: bool) -> Box<dyn Prompt> {
    if yes {
        Box::new(AssumeYes)
    } else {
        Box::new(TerminalPrompt)
    }
}

/// Asks on stderr and reads answers from stdin, leaving stdout to the
/// command's own output.
struct TerminalPrompt;

impl TerminalPrompt {
    fn read_answer(&self) -> Result<String> {
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_ascii_lowercase())
    }
}

impl Prompt for TerminalPrompt {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        eprint!("{} [y/N] ", question);
        io::stderr().flush()?;
        let answer = self.read_answer()?;
        Ok(answer == "y" || answer == "yes")
    }

    fn choose(&mut self, question: &str, options: &[&str]) -> Result<Option<usize>> {
        eprintln!("{}", question);
        for (i, option) in options.iter().enumerate() {
            eprintln!("  {}) {}", i + 1, option);
        }
        eprint!("  0) leave as is\nchoice: ");
        io::stderr().flush()?;
        let answer = self.read_answer()?;
        Ok(match answer.parse::<usize>() {
            Ok(n) if (1..=options.len()).contains(&n) => Some(n - 1),
            _ => None,
        })
    }
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn error_code(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<LabError>() {
        Some(LabError::Io { .. }) => "io_error",
        Some(LabError::Snapshot { .. }) => "snapshot_invalid",
        Some(LabError::Execution(_)) => "execution_failed",
        Some(LabError::Convergence(_)) => "not_converged",
        Some(LabError::Migration(_)) => "migration_blocked",
        Some(LabError::Refused(_)) => "refused",
        None => "command_failed",
    }
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::New { json, .. }
        | Commands::Audit { json, .. }
        | Commands::Repair { json, .. }
        | Commands::AuditStudy { json, .. }
        | Commands::RepairStudy { json, .. }
        | Commands::Migrate { json, .. }
        | Commands::MigrateStudy { json, .. }
        | Commands::CompileStudy { json, .. } => *json,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_exit_codes_are_stable() {
        assert_eq!(verdict_exit_code(Verdict::AllValid), 0);
        assert_eq!(verdict_exit_code(Verdict::NeedsReprocess), 1);
        assert_eq!(verdict_exit_code(Verdict::NeedsRepair), 2);
        assert_eq!(verdict_exit_code(Verdict::NeedsMigration), 3);
        assert_eq!(verdict_exit_code(Verdict::NeedsAggregation), 4);
        assert_eq!(repair_exit_code(RepairStatus::Aborted), 99);
        assert_eq!(repair_exit_code(RepairStatus::ConvergedInScope), 0);
        assert_eq!(repair_exit_code(RepairStatus::OutOfScope), 1);
        assert_eq!(repair_exit_code(RepairStatus::NotConverged), 1);
    }

    #[test]
    fn repair_flags_parse() {
        let cli = Cli::try_parse_from([
            "lab", "repair", "exp_1", "--start", "2", "--end", "3", "--force", "full", "--yes",
        ])
        .expect("parse");
        match cli.command {
            Commands::Repair {
                start,
                end,
                force,
                yes,
                json,
                ..
            } => {
                assert_eq!((start, end), (Some(2), Some(3)));
                assert!(matches!(force, Some(ForceArg::Full)));
                assert!(yes);
                assert!(!json);
            }
            _ => panic!("expected repair"),
        }
    }
}
