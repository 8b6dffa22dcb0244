//! Approvals bind to one plan and never carry over to a re-plan.

use conveyor_lib::apply::ApplyError;
use conveyor_lib::approval::Decision;
use conveyor_lib::artifact::Digest;
use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::pipeline::{ManualAction, RunState, Trigger, TriggerEvent};
use conveyor_lib::plan::{PlanId, PlanStatus};

use super::common::Harness;

async fn manual_plan(h: &Harness, environment: &str, digest: &Digest) -> PlanId {
  let run = h
    .orchestrator
    .handle(TriggerEvent::new(
      Trigger::Manual {
        environment: environment.to_string(),
        action: ManualAction::Plan {
          digest: digest.clone(),
          promoted_from: None,
        },
      },
      "ci",
    ))
    .await
    .unwrap();
  assert_eq!(run.state, RunState::PlannedForReview);
  run.plan_for(environment).unwrap().clone()
}

#[tokio::test]
async fn approval_of_a_superseded_plan_does_not_carry_over() {
  let h = Harness::new();
  let services = h.services();
  let prod = services.environment("prod").unwrap();
  let digest = Digest::of(b"release candidate");

  let first = manual_plan(&h, "prod", &digest).await;
  h.decide(&first, "prod", "alice", Decision::Approve);

  let second = manual_plan(&h, "prod", &digest).await;
  assert_ne!(first, second);
  assert_eq!(services.plans.status(&first).unwrap().status, PlanStatus::Superseded);

  // The old plan can no longer be applied, approved or not.
  let err = services
    .applier
    .apply(prod, &first, &services.apply_context("ci"))
    .await
    .unwrap_err();
  assert!(matches!(err, ApplyError::NotPending { .. }));
  assert_eq!(err.kind(), FailureKind::StalePlan);

  // The new plan has no approval of its own yet.
  let err = services
    .applier
    .apply(prod, &second, &services.apply_context("ci"))
    .await
    .unwrap_err();
  assert!(matches!(err, ApplyError::AwaitingApproval { .. }));

  // Replaying a decision against the superseded plan is refused.
  let replay = services
    .gate
    .record(conveyor_lib::approval::ApprovalRequest {
      plan_id: first.clone(),
      environment: "prod".to_string(),
      actor: "alice".to_string(),
      decision: Decision::Approve,
      comment: None,
    })
    .unwrap_err();
  assert_eq!(replay.kind(), FailureKind::StalePlan);

  h.decide(&second, "prod", "alice", Decision::Approve);
  let outcome = services
    .applier
    .apply(prod, &second, &services.apply_context("ci"))
    .await
    .unwrap();
  assert_eq!(outcome.plan.digest(), &digest);
  assert_eq!(services.plans.status(&second).unwrap().status, PlanStatus::Applied);
}

#[tokio::test]
async fn applied_plan_cannot_be_applied_twice() {
  let h = Harness::new();
  let services = h.services();
  let prod = services.environment("prod").unwrap();
  let digest = Digest::of(b"once");

  let plan_id = manual_plan(&h, "prod", &digest).await;
  h.decide(&plan_id, "prod", "alice", Decision::Approve);
  services
    .applier
    .apply(prod, &plan_id, &services.apply_context("ci"))
    .await
    .unwrap();

  let err = services
    .applier
    .apply(prod, &plan_id, &services.apply_context("ci"))
    .await
    .unwrap_err();
  assert!(matches!(err, ApplyError::NotPending { .. }));
  assert_eq!(services.records.history("prod").unwrap().len(), 1);
}

#[tokio::test]
async fn environments_without_approval_refuse_decisions() {
  let h = Harness::new();
  let plan_id = manual_plan(&h, "stage", &Digest::of(b"stage only")).await;

  let err = h
    .services()
    .gate
    .record(conveyor_lib::approval::ApprovalRequest {
      plan_id,
      environment: "stage".to_string(),
      actor: "alice".to_string(),
      decision: Decision::Approve,
      comment: None,
    })
    .unwrap_err();
  assert_eq!(err.kind(), FailureKind::Configuration);
}
