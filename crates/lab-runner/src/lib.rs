//! Experiment lifecycle engine: inventory and audit of experiment
//! directories, repair selection and execution, migration of legacy layouts,
//! and study-wide coordination.

pub mod audit;
pub mod create;
pub mod engine;
pub mod inventory;
pub mod migrate;
pub mod prompt;
pub mod repair;
pub mod select;
pub mod study;

pub use audit::{audit, classify, AuditOptions, AuditOutcome, Finding, FindingKind, Lifecycle, ReplicationHealth};
pub use create::create_experiment;
pub use engine::{CommandEngine, ReplicationEngine, ReplicationRequest};
pub use inventory::{scan, ExperimentInventory, StructuralIssue};
pub use migrate::{migrate_experiment, plan_migration, MigrationOutcome, MigrationPlan, MigrationStatus};
pub use prompt::{choose_forced_action, Answer, AssumeYes, Prompt, ScriptedPrompt};
pub use repair::{
    execute, rebuild_aggregates, rebuild_report, repair_experiment, RepairOutcome, RepairRequest,
    RepairStatus,
};
pub use select::{select_action, ActionKind, ForcedAction, RepairAction, RepairScope};
pub use study::{
    audit_study, compile_study, discover_experiments, migrate_study, plan_study_repair, repair_study,
    BatchStatus, ExperimentNote, StudyAudit, StudyMigrationOutcome, StudyPlan, StudyRepairOutcome,
};
