//! Infrastructure that moves between plan and apply invalidates the plan.

use conveyor_lib::apply::ApplyError;
use conveyor_lib::artifact::Digest;
use conveyor_lib::engine::ChangeAction;
use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::pipeline::{ManualAction, Stage, Trigger, TriggerEvent};
use conveyor_lib::plan::{PlanRequest, PlanStatus};

use super::common::Harness;

#[tokio::test]
async fn drift_after_planning_fails_the_apply_as_stale() {
  let h = Harness::new();
  let services = h.services();
  let dev = services.environment("dev").unwrap();
  let digest = Digest::of(b"v1");

  let plan = services
    .planner
    .plan(dev, &PlanRequest::new(digest.clone(), "ci"))
    .await
    .unwrap();

  let moved = h.engine.set_resource(dev, "setting.debug", "true").unwrap();
  assert_ne!(&moved, plan.fingerprint());

  let err = services
    .applier
    .apply(dev, &plan.id, &services.apply_context("ci"))
    .await
    .unwrap_err();

  assert_eq!(err.kind(), FailureKind::StalePlan);
  match &err {
    ApplyError::StalePlan { planned, live, .. } => {
      assert_eq!(planned, plan.fingerprint());
      assert_eq!(live, &moved);
    }
    other => panic!("unexpected error {:?}", other),
  }
  assert_eq!(services.plans.status(&plan.id).unwrap().status, PlanStatus::Stale);
  assert!(services.records.history("dev").unwrap().is_empty());
  assert!(services.locks.current("dev").await.unwrap().is_none());

  // A fresh plan sees the drift and removes it.
  let replan = services
    .planner
    .plan(dev, &PlanRequest::new(digest.clone(), "ci"))
    .await
    .unwrap();
  assert!(
    replan
      .body
      .changes
      .iter()
      .any(|c| c.address == "setting.debug" && c.action == ChangeAction::Delete)
  );
  services
    .applier
    .apply(dev, &replan.id, &services.apply_context("ci"))
    .await
    .unwrap();
  assert!(!h.engine.load(dev).unwrap().resources.contains_key("setting.debug"));
}

#[tokio::test]
async fn manual_apply_run_reports_stale_plan_at_the_apply_stage() {
  let h = Harness::new();
  let services = h.services();
  let stage = services.environment("stage").unwrap();

  let plan = services
    .planner
    .plan(stage, &PlanRequest::new(Digest::of(b"v2"), "ci"))
    .await
    .unwrap();
  h.engine.set_resource(stage, "image", "someone-else@sha256:0").unwrap();

  let err = h
    .orchestrator
    .handle(TriggerEvent::new(
      Trigger::Manual {
        environment: "stage".to_string(),
        action: ManualAction::Apply { plan_id: plan.id.clone() },
      },
      "ci",
    ))
    .await
    .unwrap_err();

  assert_eq!(err.kind(), FailureKind::StalePlan);
  assert_eq!(err.stage, Stage::Apply("stage".to_string()));
}
