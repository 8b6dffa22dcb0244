//! Shared test helpers for CLI integration tests.

use std::path::PathBuf;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use tempfile::TempDir;

pub const REVISION: &str = "4f2a9c1e7b3d5a6f8e0c2b4d6a8f0e1c3b5d7a9f";

/// Get path to a fixture file.
pub fn fixture_path(name: &str) -> PathBuf {
  PathBuf::from(env!("CARGO_MANIFEST_DIR"))
    .join("tests")
    .join("fixtures")
    .join(name)
}

/// Read fixture content.
pub fn fixture_content(name: &str) -> String {
  std::fs::read_to_string(fixture_path(name)).unwrap_or_else(|e| panic!("Failed to load fixture {}: {}", name, e))
}

/// Isolated test environment.
///
/// Each test gets its own temporary directory holding the config, a source
/// tree to build, the registries and infrastructure state it points at, and
/// the conveyor state root.
pub struct TestEnv {
  pub temp: TempDir,
  pub config_path: PathBuf,
}

impl TestEnv {
  /// Copy a fixture to `conveyor.toml` and create a small source tree.
  pub fn from_fixture(name: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let config_path = temp.path().join("conveyor.toml");
    std::fs::write(&config_path, fixture_content(name)).unwrap();
    let env = Self { temp, config_path };
    env.write_file("src/main.txt", "hello from the service\n");
    env.write_file("src/assets/config.txt", "port=8080\n");
    env
  }

  /// Write a file relative to the temp directory.
  pub fn write_file(&self, relative_path: &str, content: &str) {
    let path = self.temp.path().join(relative_path);
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
  }

  pub fn source_path(&self) -> PathBuf {
    self.temp.path().join("src")
  }

  /// State root (isolated per test).
  pub fn root_path(&self) -> PathBuf {
    let p = self.temp.path().join("conveyor-state");
    std::fs::create_dir_all(&p).unwrap();
    dunce::canonicalize(&p).unwrap_or(p)
  }

  /// Get a pre-configured Command for the conveyor binary.
  ///
  /// Points `--config` at the test config and `CONVEYOR_ROOT` at the isolated
  /// state root.
  pub fn conveyor_cmd(&self) -> Command {
    let mut cmd: Command = cargo_bin_cmd!("conveyor");
    cmd.current_dir(self.temp.path());
    cmd.env("CONVEYOR_ROOT", self.root_path());
    cmd.env("XDG_DATA_HOME", self.temp.path().join("data"));
    cmd.env_remove("CONVEYOR_ACTOR");
    cmd.env_remove("RUST_LOG");
    cmd.arg("--config").arg(&self.config_path);
    cmd
  }

  /// Run a command expected to succeed with `--json` and parse its output.
  pub fn json(&self, args: &[&str]) -> Value {
    let output = self.conveyor_cmd().arg("--json").args(args).assert().success().get_output().clone();
    serde_json::from_slice(&output.stdout)
      .unwrap_or_else(|e| panic!("invalid JSON from {:?}: {}\n{}", args, e, String::from_utf8_lossy(&output.stdout)))
  }

  /// Merge `REVISION` through dev and stage; returns the run summary.
  pub fn merge(&self) -> Value {
    let source = self.source_path();
    self.json(&[
      "trigger",
      "merge",
      "--revision",
      REVISION,
      "--path",
      source.to_str().unwrap(),
    ])
  }

  /// Plan `digest` for `environment`; returns the plan id.
  pub fn plan(&self, environment: &str, digest: &str) -> String {
    let plan = self.json(&["plan", environment, "--digest", digest]);
    plan["id"].as_str().unwrap().to_string()
  }
}
