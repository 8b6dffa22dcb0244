//! Release-tag route into the approval-gated terminal environment.

use conveyor_lib::approval::Decision;
use conveyor_lib::artifact::Digest;
use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::pipeline::{RunState, StageError, Trigger, TriggerEvent};
use conveyor_lib::plan::PlanStatus;
use conveyor_lib::record::RecordEvent;
use conveyor_lib::registry::Registry;
use conveyor_lib::services::ServicesError;

use super::common::{Harness, revision};

fn release(tag: &str) -> TriggerEvent {
  TriggerEvent::new(Trigger::ReleaseTag { tag: tag.to_string() }, "release-bot")
}

/// Merge a revision through dev and stage and tag the result as a release.
async fn staged_release(h: &Harness, tag: &str) -> Digest {
  let run = h
    .orchestrator
    .handle(TriggerEvent::new(Trigger::Merge { source: revision(7) }, "ci"))
    .await
    .unwrap();
  let digest = run.digest.unwrap();
  h.tag_release(&digest, tag).await;
  digest
}

#[tokio::test]
async fn approved_release_reaches_prod_with_the_same_digest() {
  let h = Harness::new();
  let digest = staged_release(&h, "v1.2.0").await;

  let (run, _) = tokio::join!(h.orchestrator.handle(release("v1.2.0")), async {
    let plan_id = h.wait_for_pending("prod").await;
    h.decide(&plan_id, "prod", "alice", Decision::Approve)
  });
  let run = run.unwrap();

  assert_eq!(run.state, RunState::Completed);
  assert_eq!(run.digest.as_ref(), Some(&digest));
  assert_eq!(h.prod.pull_by_tag("prod").await.unwrap().digest, digest);
  assert_eq!(h.prod.pull_by_tag("v1.2.0").await.unwrap().digest, digest);

  let record = h.services().records.current("prod").unwrap().unwrap();
  assert_eq!(record.actor, "release-bot");
  match &record.event {
    RecordEvent::Applied { source, digest: applied, .. } => {
      assert_eq!(source.as_deref(), Some("stage"));
      assert_eq!(applied, &digest);
    }
    other => panic!("unexpected record {:?}", other),
  }

  let states = h.events.states(&run.run_id);
  let approving = states.iter().position(|s| *s == RunState::Approving("prod".into())).unwrap();
  let applying = states.iter().position(|s| *s == RunState::Applying("prod".into())).unwrap();
  assert!(approving < applying);
  assert!(!states.contains(&RunState::Building));
}

#[tokio::test]
async fn rejected_release_never_touches_prod() {
  let h = Harness::new();
  staged_release(&h, "v1.3.0").await;

  let (result, plan_id) = tokio::join!(h.orchestrator.handle(release("v1.3.0")), async {
    let plan_id = h.wait_for_pending("prod").await;
    h.decide(&plan_id, "prod", "alice", Decision::Reject);
    plan_id
  });

  let err = result.unwrap_err();
  assert_eq!(err.kind(), FailureKind::ApprovalRejected);
  assert_eq!(h.services().plans.status(&plan_id).unwrap().status, PlanStatus::Rejected);
  assert!(h.services().records.history("prod").unwrap().is_empty());
  assert!(h.services().locks.current("prod").await.unwrap().is_none());

  // The artifact was promoted, but the infrastructure still points nowhere.
  let prod = h.services().environment("prod").unwrap();
  assert!(h.engine.load(prod).unwrap().resources.is_empty());
}

#[tokio::test]
async fn release_requires_every_earlier_environment_to_have_applied_it() {
  let h = Harness::new();
  let bytes = b"hand-built".to_vec();
  let tags = ["v0.1.0".to_string()].into_iter().collect();
  let digest = h.stage.push_with_tags(&bytes, &tags).await.unwrap();

  let err = h.orchestrator.handle(release("v0.1.0")).await.unwrap_err();

  assert_eq!(err.kind(), FailureKind::Configuration);
  match &err.source {
    StageError::Services(ServicesError::ChainIncomplete {
      environment,
      digest: missing,
      ..
    }) => {
      assert_eq!(environment, "dev");
      assert_eq!(missing, &digest);
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(h.prod.blob_count().await, 0);
}

#[tokio::test]
async fn second_release_is_refused_while_the_first_waits_for_approval() {
  let h = Harness::new();
  staged_release(&h, "v2.0.0").await;

  let (first, (second, plan_id)) = tokio::join!(h.orchestrator.handle(release("v2.0.0")), async {
    let plan_id = h.wait_for_pending("prod").await;
    let second = h.orchestrator.handle(release("v2.0.0")).await;
    h.decide(&plan_id, "prod", "alice", Decision::Approve);
    (second, plan_id)
  });

  assert_eq!(first.unwrap().state, RunState::Completed);
  let err = second.unwrap_err();
  assert_eq!(err.kind(), FailureKind::RunInProgress);
  assert_eq!(h.services().plans.status(&plan_id).unwrap().status, PlanStatus::Applied);
}

#[tokio::test]
async fn gated_release_is_protected_from_another_orchestrator() {
  let h = Harness::new();
  staged_release(&h, "v2.1.0").await;
  let other = h.second_orchestrator();

  let (first, (second, plan_id)) = tokio::join!(h.orchestrator.handle(release("v2.1.0")), async {
    let plan_id = h.wait_for_pending("prod").await;
    let second = other.handle(release("v2.1.0")).await;
    // Refusal happens before planning, so the waiting plan is untouched.
    assert_eq!(h.services().plans.pending("prod").unwrap(), Some(plan_id.clone()));
    h.decide(&plan_id, "prod", "alice", Decision::Approve);
    (second, plan_id)
  });

  let err = second.unwrap_err();
  assert_eq!(err.kind(), FailureKind::RunInProgress);
  assert!(matches!(err.source, StageError::Claim(_)));
  assert_eq!(first.unwrap().state, RunState::Completed);
  assert_eq!(h.services().plans.status(&plan_id).unwrap().status, PlanStatus::Applied);
}

#[tokio::test]
async fn cancelling_a_gated_release_from_another_orchestrator_stops_it() {
  let h = Harness::new();
  staged_release(&h, "v2.2.0").await;
  let other = h.second_orchestrator();

  let (first, run_id) = tokio::join!(h.orchestrator.handle(release("v2.2.0")), async {
    h.wait_for_pending("prod").await;
    let run = h.orchestrator.runs().list().unwrap().into_iter().next().unwrap();
    other.registry().cancel(&run.run_id, "oncall").await.unwrap().unwrap();
    run.run_id
  });

  let err = first.unwrap_err();
  assert_eq!(err.kind(), FailureKind::Cancelled);
  let stored = h.orchestrator.runs().load(&run_id).unwrap().unwrap();
  assert_eq!(stored.state, RunState::Cancelled);
  assert!(h.services().records.history("prod").unwrap().is_empty());
}

#[tokio::test]
async fn the_release_actor_cannot_approve_their_own_release() {
  let h = Harness::new();
  staged_release(&h, "v3.0.0").await;

  let (result, _) = tokio::join!(h.orchestrator.handle(release("v3.0.0")), async {
    let plan_id = h.wait_for_pending("prod").await;
    let refused = h
      .services()
      .gate
      .record(conveyor_lib::approval::ApprovalRequest {
        plan_id: plan_id.clone(),
        environment: "prod".to_string(),
        actor: "release-bot".to_string(),
        decision: Decision::Approve,
        comment: None,
      })
      .unwrap_err();
    assert_eq!(refused.kind(), FailureKind::Forbidden);
    h.decide(&plan_id, "prod", "bob", Decision::Approve)
  });

  assert_eq!(result.unwrap().state, RunState::Completed);
}
