//! Build, merge and promotion through the CLI.

use predicates::prelude::*;

use super::common::{REVISION, TestEnv};

#[test]
fn merge_deploys_one_digest_to_dev_and_stage() {
  let env = TestEnv::from_fixture("pipeline.toml");

  let run = env.merge();
  assert_eq!(run["state"]["state"], "completed");
  assert_eq!(run["trigger"], "merge");
  let digest = run["digest"].as_str().unwrap().to_string();
  assert!(digest.starts_with("sha256:"));

  let status = env.json(&["status"]);
  let status = status.as_array().unwrap();
  assert_eq!(status.len(), 3);
  assert_eq!(status[0]["environment"], "dev");
  assert_eq!(status[0]["deployed"], digest.as_str());
  assert_eq!(status[1]["deployed"], digest.as_str());
  assert!(status[2].get("deployed").is_none());
}

#[test]
fn building_a_revision_twice_reuses_its_digest() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let source = env.source_path();
  let args = ["build", "--revision", REVISION, "--path", source.to_str().unwrap()];

  let first = env.json(&args);
  let second = env.json(&args);

  assert_eq!(first["digest"], second["digest"]);
  assert_eq!(first["reused"], false);
  assert_eq!(second["reused"], true);

  env
    .conveyor_cmd()
    .args(["resolve", "dev", "dev"])
    .assert()
    .success()
    .stdout(predicate::str::contains(first["digest"].as_str().unwrap()));
}

#[test]
fn changed_source_under_the_same_revision_is_divergent() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let source = env.source_path();
  let args = ["build", "--revision", REVISION, "--path", source.to_str().unwrap()];

  env.conveyor_cmd().args(args).assert().success();
  env.write_file("src/main.txt", "something else entirely\n");

  env
    .conveyor_cmd()
    .args(args)
    .assert()
    .code(32)
    .stderr(predicate::str::contains("was already built as"));
}

#[test]
fn promote_copies_the_digest_between_registries() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let source = env.source_path();
  let built = env.json(&["build", "--revision", REVISION, "--path", source.to_str().unwrap()]);
  let digest = built["digest"].as_str().unwrap();
  let plan_id = env.plan("dev", digest);
  env.conveyor_cmd().args(["apply", "dev", "--plan", &plan_id]).assert().success();

  let promotion = env.json(&["promote", "dev", "stage", "--digest", digest]);
  assert_eq!(promotion["digest"], digest);

  env
    .conveyor_cmd()
    .args(["resolve", "stage", "stage"])
    .assert()
    .success()
    .stdout(predicate::str::contains(digest));
}

#[test]
fn promote_refuses_to_skip_an_environment() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let source = env.source_path();
  let built = env.json(&["build", "--revision", REVISION, "--path", source.to_str().unwrap()]);
  let digest = built["digest"].as_str().unwrap();

  env
    .conveyor_cmd()
    .args(["promote", "dev", "stage", "--digest", digest])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("dev has not applied"));

  env
    .conveyor_cmd()
    .args(["promote", "dev", "stage", "--digest", digest, "--skip-chain-check"])
    .assert()
    .success();
}

#[test]
fn stale_plan_exits_with_its_own_code() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let digest = format!("sha256:{}", "ab".repeat(32));
  let plan_id = env.plan("dev", &digest);

  // Someone changes the infrastructure by hand.
  env.write_file("state/dev/infra.json", r#"{"serial": 41, "resources": {"image": "elsewhere"}}"#);

  env
    .conveyor_cmd()
    .args(["apply", "dev", "--plan", &plan_id])
    .assert()
    .code(31)
    .stderr(predicate::str::contains("stale"));
}

#[test]
fn runs_lists_the_merge() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let run = env.merge();

  env
    .conveyor_cmd()
    .arg("runs")
    .assert()
    .success()
    .stdout(predicate::str::contains("merge"))
    .stdout(predicate::str::contains("completed"));

  let runs = env.json(&["runs"]);
  assert_eq!(runs[0]["run_id"], run["run_id"]);
}

#[test]
fn history_shows_applied_digests() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let run = env.merge();
  let digest = run["digest"].as_str().unwrap();

  env
    .conveyor_cmd()
    .args(["history", "stage"])
    .assert()
    .success()
    .stdout(predicate::str::contains("applied"))
    .stdout(predicate::str::contains(digest))
    .stdout(predicate::str::contains("from dev"));
}

#[test]
fn invalid_digest_is_a_usage_error() {
  let env = TestEnv::from_fixture("pipeline.toml");

  env
    .conveyor_cmd()
    .args(["plan", "dev", "--digest", "latest"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("Invalid --digest"));
}

#[test]
fn unknown_environment_is_a_usage_error() {
  let env = TestEnv::from_fixture("pipeline.toml");

  env
    .conveyor_cmd()
    .args(["history", "qa"])
    .assert()
    .code(2)
    .stderr(predicate::str::contains("unknown environment 'qa'"));
}

#[test]
fn missing_config_exits_not_found() {
  let env = TestEnv::from_fixture("pipeline.toml");
  std::fs::remove_file(&env.config_path).unwrap();

  env
    .conveyor_cmd()
    .arg("status")
    .assert()
    .code(3)
    .stderr(predicate::str::contains("config file not found"));
}

#[test]
fn cancel_leaves_a_request_for_an_unfinished_run() {
  let env = TestEnv::from_fixture("pipeline.toml");
  let run = env.merge();
  let run_id = run["run_id"].as_str().unwrap();

  env
    .conveyor_cmd()
    .args(["cancel", &run_id[..8]])
    .assert()
    .success()
    .stdout(predicate::str::contains("already finished"));

  // Rewind the stored run to look like one still waiting at the gate.
  let record_path = env.root_path().join("runs").join(format!("{}.json", run_id));
  let mut stored: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&record_path).unwrap()).unwrap();
  stored["state"] = serde_json::json!({"state": "approving", "environment": "stage"});
  stored.as_object_mut().unwrap().remove("finished_at");
  std::fs::write(&record_path, stored.to_string()).unwrap();

  let request = env.json(&["--actor", "oncall", "cancel", &run_id[..8]]);
  assert_eq!(request["run_id"], run_id);
  assert_eq!(request["requested_by"], "oncall");
  assert!(env.root_path().join("runs").join("cancel").join(format!("{}.json", run_id)).exists());

  env
    .conveyor_cmd()
    .args(["cancel", "ffffffffffff"])
    .assert()
    .code(1)
    .stderr(predicate::str::contains("No run matches"));
}
