mod common;

use std::fs;

use common::{legacy_experiment, replication_dir, FakeEngine, BASE_SEED};
use lab_core::{layout, tree_digest, ConfigSnapshot, Verdict};
use lab_runner::{
    migrate_experiment, repair_experiment, Answer, AssumeYes, MigrationStatus, RepairRequest,
    RepairStatus, ScriptedPrompt,
};

#[test]
fn legacy_runs_become_the_current_layout() {
    let tmp = tempfile::tempdir().expect("tmp");
    let exp = tmp.path().join("exp_1");
    legacy_experiment(&exp, 3, 2);

    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let outcome = migrate_experiment(&exp, None, &mut prompt).expect("migrate");
    assert_eq!(outcome.status, MigrationStatus::Migrated);
    assert_eq!(prompt.asked.len(), 1);

    for index in 1..=3 {
        assert!(!exp.join(format!("run_{}", index)).exists());
        let dir = replication_dir(&exp, index);
        assert!(dir.join(layout::report_file_name(index)).is_file());
        assert!(!dir.join(layout::LEGACY_REPORT).exists());
    }
    assert!(ConfigSnapshot::load(&exp).expect("snapshot").is_current());
    let post = outcome.post.expect("post audit");
    assert_eq!(post.verdict, Verdict::NeedsAggregation);

    let mut engine = FakeEngine::default();
    let repaired = repair_experiment(&exp, &RepairRequest::default(), &mut engine, &mut AssumeYes)
        .expect("repair");
    assert_eq!(repaired.status, RepairStatus::Converged);
    assert!(engine.calls.is_empty());
}

#[test]
fn missing_snapshot_is_captured_from_the_global_config() {
    let tmp = tempfile::tempdir().expect("tmp");
    let exp = tmp.path().join("exp_1");
    legacy_experiment(&exp, 2, 1);
    fs::remove_file(exp.join(layout::CONFIG_SNAPSHOT)).expect("rm");
    let global = tmp.path().join("global.ini");
    fs::write(
        &global,
        format!(
            "[Study]\nnum_replications = 2\nnum_trials = 1\nbase_seed = {}\n",
            BASE_SEED
        ),
    )
    .expect("global");

    let outcome = migrate_experiment(&exp, Some(global.as_path()), &mut AssumeYes).expect("migrate");
    assert_eq!(outcome.status, MigrationStatus::Migrated);
    let snapshot = ConfigSnapshot::load(&exp).expect("snapshot");
    assert!(snapshot.is_current());
    assert_eq!(snapshot.num_replications, 2);
    assert_eq!(outcome.post.expect("post").verdict, Verdict::NeedsAggregation);
}

#[test]
fn declined_migration_changes_nothing() {
    let tmp = tempfile::tempdir().expect("tmp");
    let exp = tmp.path().join("exp_1");
    legacy_experiment(&exp, 2, 1);
    let before = tree_digest(&exp, &[]).expect("digest");

    let mut prompt = ScriptedPrompt::new([Answer::No]);
    let outcome = migrate_experiment(&exp, None, &mut prompt).expect("migrate");
    assert_eq!(outcome.status, MigrationStatus::Aborted);
    assert_eq!(tree_digest(&exp, &[]).expect("digest"), before);
}
