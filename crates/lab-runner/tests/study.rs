mod common;

use std::fs;

use common::{complete_experiment, legacy_experiment, new_experiment, replication_dir, FakeEngine};
use lab_core::{layout, tree_digest, LabError, Verdict};
use lab_runner::{
    audit_study, compile_study, migrate_study, plan_study_repair, repair_study, Answer, AssumeYes,
    AuditOptions, BatchStatus, ScriptedPrompt,
};

#[test]
fn study_verdict_is_the_most_severe_experiment_verdict() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    complete_experiment(&study.join("exp_1"), 2, 1);
    complete_experiment(&study.join("exp_2"), 2, 1);
    fs::remove_file(replication_dir(&study.join("exp_2"), 1).join(layout::report_file_name(1)))
        .expect("rm");
    new_experiment(&study.join("exp_3"), 2, 1);
    fs::create_dir_all(study.join("notes")).expect("notes");

    let audit = audit_study(study, AuditOptions::default()).expect("audit");
    let verdicts: Vec<(String, Verdict)> = audit
        .experiments
        .iter()
        .map(|e| (e.name.clone(), e.outcome.verdict))
        .collect();
    assert_eq!(
        verdicts,
        vec![
            ("exp_1".to_string(), Verdict::AllValid),
            ("exp_2".to_string(), Verdict::NeedsReprocess),
            ("exp_3".to_string(), Verdict::NeedsRepair),
        ]
    );
    assert_eq!(audit.overall, Verdict::NeedsRepair);
    assert!(!audit.aggregates.evaluated);
}

#[test]
fn migration_waits_for_repairs_and_study_converges() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    new_experiment(&study.join("exp_1"), 2, 1);
    legacy_experiment(&study.join("exp_2"), 2, 1);

    let err = migrate_study(study, None, &mut AssumeYes).expect_err("repair must come first");
    assert!(matches!(err.downcast_ref::<LabError>(), Some(LabError::Refused(_))));
    assert!(study.join("exp_2").join("run_1").is_dir());

    let audit = audit_study(study, AuditOptions::default()).expect("audit");
    assert_eq!(audit.overall, Verdict::NeedsMigration);
    let plan = plan_study_repair(&audit, None);
    assert_eq!(plan.actions.len(), 1);
    assert_eq!(plan.actions[0].experiment, "exp_1");
    assert_eq!(plan.deferred.len(), 1);
    assert_eq!(plan.deferred[0].experiment, "exp_2");
    assert!(!plan.rebuild_study_aggregates);

    let mut engine = FakeEngine::default();
    let mut prompt = ScriptedPrompt::new([Answer::Yes]);
    let repaired = repair_study(study, None, &mut engine, &mut prompt).expect("repair");
    assert_eq!(repaired.status, BatchStatus::Completed);
    assert_eq!(repaired.completed, vec!["exp_1".to_string()]);
    assert_eq!(prompt.asked.len(), 1, "one confirmation for the whole batch");
    assert!(!study.join(layout::STUDY_RESULTS).exists());

    let migrated = migrate_study(study, None, &mut AssumeYes).expect("migrate");
    assert_eq!(migrated.status, BatchStatus::Completed);
    assert_eq!(migrated.migrated, vec!["exp_2".to_string()]);
    let post = migrated.post.expect("post audit");
    assert_eq!(post.overall, Verdict::NeedsAggregation);

    let engine_calls = engine.calls.len();
    let finished = repair_study(study, None, &mut engine, &mut AssumeYes).expect("repair");
    assert_eq!(finished.status, BatchStatus::Completed);
    assert_eq!(engine.calls.len(), engine_calls, "aggregation is local");
    assert_eq!(finished.post.expect("post").overall, Verdict::AllValid);
    assert!(study.join(layout::STUDY_AUDIT_LOG).is_file());

    let results = fs::read(study.join(layout::STUDY_RESULTS)).expect("study results");
    let header = String::from_utf8_lossy(&results);
    assert!(header.starts_with("experiment,replication,seed,trial,score,response_sha256"));
    compile_study(study).expect("compile");
    assert_eq!(fs::read(study.join(layout::STUDY_RESULTS)).expect("study results"), results);
}

#[test]
fn batch_repair_halts_on_first_failure_in_natural_order() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    for name in ["exp_1", "exp_10", "exp_2"] {
        new_experiment(&study.join(name), 2, 1);
    }

    let mut engine = FakeEngine::failing_in("exp_2");
    let outcome = repair_study(study, None, &mut engine, &mut AssumeYes).expect("repair");
    assert_eq!(outcome.status, BatchStatus::Halted);
    assert_eq!(outcome.completed, vec!["exp_1".to_string()]);
    let failed = outcome.failed.expect("failure recorded");
    assert_eq!(failed.experiment, "exp_2");
    assert!(failed.reason.contains("simulated engine failure"));
    assert_eq!(outcome.not_attempted, vec!["exp_10".to_string()]);
    assert_eq!(
        engine.calls,
        vec![
            ("exp_1".to_string(), 1),
            ("exp_1".to_string(), 2),
            ("exp_2".to_string(), 1),
        ]
    );
    assert!(!replication_dir(&study.join("exp_10"), 1).exists());
    assert_eq!(outcome.post.expect("post").overall, Verdict::NeedsRepair);
}

#[test]
fn declined_batch_leaves_the_study_untouched() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    complete_experiment(&study.join("exp_1"), 2, 1);
    new_experiment(&study.join("exp_2"), 2, 1);
    let before = tree_digest(study, &[]).expect("digest");

    let mut engine = FakeEngine::default();
    let mut prompt = ScriptedPrompt::new([Answer::No]);
    let outcome = repair_study(study, None, &mut engine, &mut prompt).expect("repair");
    assert_eq!(outcome.status, BatchStatus::Aborted);
    assert!(engine.calls.is_empty());
    assert_eq!(tree_digest(study, &[]).expect("digest"), before);
}

#[test]
fn compile_is_refused_until_every_experiment_is_valid() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    complete_experiment(&study.join("exp_1"), 1, 1);
    new_experiment(&study.join("exp_2"), 1, 1);

    let err = compile_study(study).expect_err("refused");
    assert!(err.to_string().contains("exp_2"));
    assert!(!study.join(layout::STUDY_RESULTS).exists());
}

#[test]
fn empty_study_is_valid() {
    let tmp = tempfile::tempdir().expect("tmp");
    let audit = audit_study(tmp.path(), AuditOptions::default()).expect("audit");
    assert!(audit.experiments.is_empty());
    assert_eq!(audit.overall, Verdict::AllValid);
    assert!(!audit.needs_compile());
}

#[test]
fn uncompiled_study_keeps_the_worst_experiment_verdict() {
    let tmp = tempfile::tempdir().expect("tmp");
    let study = tmp.path();
    complete_experiment(&study.join("exp_1"), 2, 1);
    complete_experiment(&study.join("exp_2"), 1, 2);

    let audit = audit_study(study, AuditOptions::default()).expect("audit");
    let children = audit.experiments.iter().map(|e| e.outcome.verdict);
    assert_eq!(audit.overall, Verdict::worst(children));
    assert_eq!(audit.overall, Verdict::AllValid);
    assert!(audit.needs_compile());
    assert!(audit.report_text.contains("need rebuilding"));

    let mut engine = FakeEngine::default();
    let mut prompt = ScriptedPrompt::default();
    let outcome = repair_study(study, None, &mut engine, &mut prompt).expect("repair");
    assert_eq!(outcome.status, BatchStatus::Completed);
    assert!(outcome.plan.actions.is_empty());
    assert!(engine.calls.is_empty());
    assert!(prompt.asked.is_empty(), "local rebuild needs no confirmation");
    let post = outcome.post.expect("post");
    assert!(!post.needs_compile());
    assert!(study.join(layout::STUDY_RESULTS).is_file());
}
