//! Environment locks and force-unlock through the CLI.

use predicates::prelude::*;

use super::common::TestEnv;

const DIGEST: &str = "sha256:0000000000000000000000000000000000000000000000000000000000000001";

fn foreign_lease(env: &TestEnv, environment: &str, lock_id: &str) {
  let lease = format!(
    r#"{{
  "lock_id": "{lock_id}",
  "environment": "{environment}",
  "state": "state/{environment}",
  "holder": "crashed-runner",
  "acquired_at": "2026-01-01T00:00:00Z",
  "expires_at": "2999-01-01T00:00:00Z"
}}"#
  );
  let path = env.root_path().join("locks").join(format!("{}.json", environment));
  std::fs::create_dir_all(path.parent().unwrap()).unwrap();
  std::fs::write(path, lease).unwrap();
}

#[test]
fn held_lock_times_out_planning() {
  let env = TestEnv::from_fixture("pipeline.toml");
  foreign_lease(&env, "dev", "lease-1");

  env
    .conveyor_cmd()
    .args(["plan", "dev", "--digest", DIGEST])
    .assert()
    .code(12)
    .stderr(predicate::str::contains("crashed-runner"));
}

#[test]
fn force_unlock_releases_and_records_the_lock() {
  let env = TestEnv::from_fixture("pipeline.toml");
  foreign_lease(&env, "dev", "lease-1");

  let status = env.json(&["status", "dev"]);
  assert_eq!(status[0]["lock"]["holder"], "crashed-runner");

  env
    .conveyor_cmd()
    .args(["--actor", "oncall", "force-unlock", "dev", "--lock-id", "lease-1", "--force"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Released lock lease-1"));

  env
    .conveyor_cmd()
    .args(["history", "dev"])
    .assert()
    .success()
    .stdout(predicate::str::contains("force-unlocked lease-1 held by crashed-runner by oncall"));

  env.conveyor_cmd().args(["plan", "dev", "--digest", DIGEST]).assert().success();
}

#[test]
fn force_unlock_requires_the_current_lock_id() {
  let env = TestEnv::from_fixture("pipeline.toml");
  foreign_lease(&env, "dev", "lease-1");

  env
    .conveyor_cmd()
    .args(["force-unlock", "dev", "--lock-id", "lease-2", "--force"])
    .assert()
    .code(3);

  let status = env.json(&["status", "dev"]);
  assert_eq!(status[0]["lock"]["lock_id"], "lease-1");
}

#[test]
fn force_unlock_without_force_refuses_in_non_interactive_mode() {
  let env = TestEnv::from_fixture("pipeline.toml");
  foreign_lease(&env, "dev", "lease-1");

  env
    .conveyor_cmd()
    .args(["force-unlock", "dev", "--lock-id", "lease-1"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("non-interactive"));
}

#[test]
fn force_unlock_on_a_free_environment_is_a_no_op() {
  let env = TestEnv::from_fixture("pipeline.toml");

  env
    .conveyor_cmd()
    .args(["force-unlock", "dev", "--lock-id", "anything", "--force"])
    .assert()
    .success()
    .stdout(predicate::str::contains("dev is not locked"));
}
