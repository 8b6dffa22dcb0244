//! Approval gate on the terminal environment through the CLI.

use predicates::prelude::*;

use super::common::TestEnv;

fn staged_digest(env: &TestEnv) -> String {
  let run = env.merge();
  run["digest"].as_str().unwrap().to_string()
}

#[test]
fn prod_apply_requires_an_approval_from_someone_else() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let digest = staged_digest(&env);
  let plan_id = env.plan("prod", &digest);

  env
    .conveyor_cmd()
    .args(["apply", "prod", "--plan", &plan_id])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("has no approval yet"));

  // The planner cannot approve their own plan.
  env
    .conveyor_cmd()
    .args(["approve", &plan_id])
    .assert()
    .code(22)
    .stderr(predicate::str::contains("may not approve"));

  env
    .conveyor_cmd()
    .args(["--actor", "alice", "approve", &plan_id, "--comment", "ship it"])
    .assert()
    .success()
    .stdout(predicate::str::contains("approved"));

  env
    .conveyor_cmd()
    .args(["apply", "prod", "--plan", &plan_id[..8]])
    .assert()
    .success()
    .stdout(predicate::str::contains("Applied"));

  let status = env.json(&["status", "prod"]);
  assert_eq!(status[0]["deployed"], digest.as_str());
  assert!(status[0].get("pending_plan").is_none());
}

#[test]
fn rejected_plan_cannot_be_applied() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let digest = staged_digest(&env);
  let plan_id = env.plan("prod", &digest);

  env
    .conveyor_cmd()
    .args(["--actor", "alice", "reject", &plan_id])
    .assert()
    .success()
    .stderr(predicate::str::contains("rejected"));

  env
    .conveyor_cmd()
    .args(["apply", "prod", "--plan", &plan_id])
    .assert()
    .code(50);

  env
    .conveyor_cmd()
    .args(["history", "prod"])
    .assert()
    .success()
    .stdout(predicate::str::contains("No promotion records"));
}

#[test]
fn approval_of_a_replaced_plan_is_refused() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let digest = staged_digest(&env);
  let first = env.plan("prod", &digest);
  let second = env.plan("prod", &digest);
  assert_ne!(first, second);

  env
    .conveyor_cmd()
    .args(["--actor", "alice", "approve", &first])
    .assert()
    .code(31)
    .stderr(predicate::str::contains("not the pending plan"));
}

#[test]
fn waiting_apply_gives_up_after_the_approval_timeout() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let digest = staged_digest(&env);
  let plan_id = env.plan("prod", &digest);

  env
    .conveyor_cmd()
    .args(["apply", "prod", "--plan", &plan_id, "--wait"])
    .assert()
    .code(51)
    .stderr(predicate::str::contains("no decision"));
}
