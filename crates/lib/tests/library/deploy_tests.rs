//! Merge and change-proposal routes.

use std::time::Duration;

use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::pipeline::{RunState, Trigger, TriggerEvent};
use conveyor_lib::record::RecordEvent;
use conveyor_lib::registry::Registry;

use super::common::{Harness, revision};

#[tokio::test]
async fn merge_builds_once_and_deploys_dev_then_stage() {
  let h = Harness::new();
  let source = revision(1);

  let run = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: source.clone() }, "ci"))
    .await
    .unwrap();

  assert_eq!(run.state, RunState::Completed);
  assert_eq!(h.backend.calls(), 1);
  let digest = run.digest.clone().unwrap();

  // The same digest is what each registry serves under its environment tag.
  assert_eq!(h.dev.pull_by_tag("dev").await.unwrap().digest, digest);
  assert_eq!(h.dev.pull_by_tag(source.short_revision()).await.unwrap().digest, digest);
  assert_eq!(h.stage.pull_by_tag("stage").await.unwrap().digest, digest);
  assert_eq!(h.prod.blob_count().await, 0);

  let records = &h.services().records;
  let dev = records.current("dev").unwrap().unwrap();
  let stage = records.current("stage").unwrap().unwrap();
  assert_eq!(dev.applied_digest(), Some(&digest));
  assert_eq!(stage.applied_digest(), Some(&digest));
  match &stage.event {
    RecordEvent::Applied { source, .. } => assert_eq!(source.as_deref(), Some("dev")),
    other => panic!("unexpected record {:?}", other),
  }
  assert!(records.history("prod").unwrap().is_empty());

  assert_eq!(
    h.events.states(&run.run_id),
    vec![
      RunState::Triggered,
      RunState::Building,
      RunState::Planning("dev".into()),
      RunState::Applying("dev".into()),
      RunState::Promoting("stage".into()),
      RunState::Planning("stage".into()),
      RunState::Applying("stage".into()),
      RunState::Completed,
    ]
  );
}

#[tokio::test]
async fn infrastructure_points_at_the_promoted_digest() {
  let h = Harness::new();
  let run = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: revision(2) }, "ci"))
    .await
    .unwrap();
  let digest = run.digest.unwrap();

  let stage = h.services().environment("stage").unwrap();
  let state = h.engine.load(stage).unwrap();
  assert_eq!(state.resources.get("image"), Some(&stage.image_reference(&digest)));
}

#[tokio::test]
async fn rerunning_a_merge_reuses_the_recorded_digest() {
  let h = Harness::new();
  let source = revision(3);

  let first = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: source.clone() }, "ci"))
    .await
    .unwrap();
  let second = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: source.clone() }, "ci"))
    .await
    .unwrap();

  assert_eq!(first.digest, second.digest);
  assert_eq!(h.dev.blob_count().await, 1);
  assert_eq!(h.stage.blob_count().await, 1);

  let entry = h.services().builder.ledger().lookup(&source.revision).unwrap().unwrap();
  assert_eq!(Some(entry.digest), first.digest);

  // The second run found nothing to change but still records the promotion.
  let stage_plan = h.services().plans.load(second.plan_for("stage").unwrap()).unwrap();
  assert!(stage_plan.is_noop());
  assert_eq!(h.services().records.history("stage").unwrap().len(), 2);
}

#[tokio::test]
async fn change_proposal_stops_after_planning() {
  let h = Harness::new();

  let run = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::ChangeProposal { source: revision(4) }, "dev-user"))
    .await
    .unwrap();

  assert_eq!(run.state, RunState::PlannedForReview);
  let plan_id = run.plan_for("dev").unwrap();
  assert_eq!(h.services().plans.pending("dev").unwrap().as_ref(), Some(plan_id));
  assert!(h.services().records.history("dev").unwrap().is_empty());
  assert_eq!(h.stage.blob_count().await, 0);
}

#[tokio::test]
async fn unconfigured_trigger_is_a_configuration_error() {
  let h = Harness::with_config(
    r#"
[[environments]]
name = "dev"
registry = "registries/dev"
state = "state/dev"
"#,
  );

  let err = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: revision(5) }, "ci"))
    .await
    .unwrap_err();

  assert_eq!(err.kind(), FailureKind::Configuration);
  assert_eq!(h.backend.calls(), 0);
}

#[tokio::test]
async fn failed_run_is_persisted_with_its_failure() {
  let h = Harness::new();

  let err = h
    .orchestrator
    .handle(TriggerEvent::new(
      Trigger::ReleaseTag {
        tag: "v9.9.9".to_string(),
      },
      "release-bot",
    ))
    .await
    .unwrap_err();

  assert_eq!(err.kind(), FailureKind::NotFound);
  let stored = h.orchestrator.runs().load(&err.run_id).unwrap().unwrap();
  assert_eq!(stored.state, RunState::Failed);
  assert!(stored.finished_at.is_some());
  let failure = stored.failure.unwrap();
  assert_eq!(failure.kind, FailureKind::NotFound);
  assert_eq!(failure.stage, "resolve");
  assert_eq!(h.events.states(&err.run_id).last(), Some(&RunState::Failed));
}

#[tokio::test]
async fn newer_merge_cancels_the_run_it_supersedes() {
  let h = Harness::new();
  let merge = |n| TriggerEvent::new(Trigger::Merge { source: revision(n) }, "ci");
  let release_build = h.backend.hold_next_build();

  let (older, newer) = tokio::join!(h.orchestrator.handle(merge(6)), async {
    while h.backend.calls() == 0 {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let newer = h.orchestrator.handle(merge(7)).await;
    release_build.notify_one();
    newer
  });

  let newer = newer.unwrap();
  assert_eq!(newer.state, RunState::Completed);

  let err = older.unwrap_err();
  assert_eq!(err.kind(), FailureKind::Cancelled);
  let stored = h.orchestrator.runs().load(&err.run_id).unwrap().unwrap();
  assert_eq!(stored.state, RunState::Cancelled);
  assert_eq!(h.events.states(&err.run_id).last(), Some(&RunState::Cancelled));

  // The superseded run never reached an apply.
  let dev = h.services().records.history("dev").unwrap();
  assert_eq!(dev.len(), 1);
  assert_eq!(dev[0].applied_digest(), newer.digest.as_ref());
  assert_eq!(h.services().records.current("stage").unwrap().unwrap().applied_digest(), newer.digest.as_ref());
}

#[tokio::test]
async fn merge_from_another_orchestrator_cancels_the_older_run() {
  let h = Harness::new();
  let other = h.second_orchestrator();
  let merge = |n| TriggerEvent::new(Trigger::Merge { source: revision(n) }, "ci");
  let release_build = h.backend.hold_next_build();

  let (older, newer) = tokio::join!(h.orchestrator.handle(merge(8)), async {
    while h.backend.calls() == 0 {
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let newer = other.handle(merge(9)).await;
    release_build.notify_one();
    newer
  });

  assert_eq!(newer.unwrap().state, RunState::Completed);
  let err = older.unwrap_err();
  assert_eq!(err.kind(), FailureKind::Cancelled);
  assert_eq!(h.services().records.history("dev").unwrap().len(), 1);
}
