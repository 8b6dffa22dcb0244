//! Shared fixtures for pipeline scenario tests.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::Notify;

use conveyor_lib::approval::{Approval, ApprovalRequest, Decision};
use conveyor_lib::artifact::{Digest, SourceRef};
use conveyor_lib::build::BuildBackend;
use conveyor_lib::config::Config;
use conveyor_lib::engine::LocalEngine;
use conveyor_lib::lock::MemoryLockBackend;
use conveyor_lib::paths::StatePaths;
use conveyor_lib::pipeline::{Orchestrator, RecordingSink};
use conveyor_lib::plan::PlanId;
use conveyor_lib::registry::{MemoryRegistry, Registries, Registry};
use conveyor_lib::services::Services;

pub const PIPELINE: &str = r#"
[pipeline]
lease_ttl = "1m"
lock_wait = "2s"
lock_poll = "5ms"
approval_poll = "10ms"
approval_timeout = "5s"
prevent_self_review = true

[retry]
max_attempts = 3
initial_delay = "1ms"
max_delay = "2ms"

[[environments]]
name = "dev"
registry = "registries/dev"
state = "state/dev"
tags = ["{short_revision}", "dev"]

[[environments]]
name = "stage"
registry = "registries/stage"
state = "state/stage"
tags = ["stage"]

[[environments]]
name = "prod"
registry = "registries/prod"
state = "state/prod"
tags = ["{release}", "prod"]
requires_approval = true

[environments.settings]
replicas = "3"

[triggers]
change_proposal = { environment = "dev" }
merge = { environments = ["dev", "stage"] }
release_tag = { source = "stage", target = "prod" }
"#;

/// Produces bytes derived from the revision and counts invocations.
#[derive(Default)]
pub struct RevisionBackend {
  calls: AtomicUsize,
  hold: Mutex<Option<Arc<Notify>>>,
}

impl RevisionBackend {
  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  /// Make the next build block until the returned notify fires.
  pub fn hold_next_build(&self) -> Arc<Notify> {
    let release = Arc::new(Notify::new());
    *self.hold.lock().unwrap() = Some(release.clone());
    release
  }
}

#[async_trait]
impl BuildBackend for RevisionBackend {
  async fn build(&self, source: &SourceRef) -> Result<Vec<u8>, String> {
    let hold = self.hold.lock().unwrap().take();
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(release) = hold {
      release.notified().await;
    }
    Ok(format!("artifact for {}", source.revision).into_bytes())
  }
}

/// One pipeline over in-memory registries and locks and an on-disk engine.
pub struct Harness {
  _temp: TempDir,
  pub services: Arc<Services>,
  pub orchestrator: Orchestrator,
  pub events: Arc<RecordingSink>,
  pub backend: Arc<RevisionBackend>,
  pub dev: MemoryRegistry,
  pub stage: MemoryRegistry,
  pub prod: MemoryRegistry,
  /// Same state files the pipeline's engine uses, for simulating drift.
  pub engine: LocalEngine,
}

impl Harness {
  pub fn new() -> Self {
    Self::with_config(PIPELINE)
  }

  pub fn with_config(toml: &str) -> Self {
    let temp = TempDir::new().unwrap();
    let config = Config::parse(toml, temp.path().to_path_buf()).unwrap();
    let paths = StatePaths::new(temp.path().join("conveyor"));

    let dev = MemoryRegistry::new("mem://dev");
    let stage = MemoryRegistry::new("mem://stage");
    let prod = MemoryRegistry::new("mem://prod");
    let mut registries = Registries::new();
    registries.insert("dev", Arc::new(dev.clone()) as Arc<dyn Registry>);
    registries.insert("stage", Arc::new(stage.clone()) as Arc<dyn Registry>);
    registries.insert("prod", Arc::new(prod.clone()) as Arc<dyn Registry>);

    let backend = Arc::new(RevisionBackend::default());
    let services = Arc::new(Services::new(
      config,
      paths,
      registries,
      Arc::new(LocalEngine::new(temp.path())),
      Arc::new(MemoryLockBackend::new()),
      backend.clone(),
    ));

    let events = Arc::new(RecordingSink::new());
    let orchestrator = Orchestrator::new(services.clone(), events.clone());
    let engine = LocalEngine::new(temp.path());

    Self {
      _temp: temp,
      services,
      orchestrator,
      events,
      backend,
      dev,
      stage,
      prod,
      engine,
    }
  }

  pub fn services(&self) -> &Services {
    &self.services
  }

  /// Another orchestrator over the same services and state root, standing in
  /// for a second conveyor process.
  pub fn second_orchestrator(&self) -> Orchestrator {
    Orchestrator::new(self.services.clone(), self.events.clone())
  }

  /// Tag an artifact already in the stage registry as a release.
  pub async fn tag_release(&self, digest: &Digest, tag: &str) {
    let bytes = self.stage.pull_by_digest(digest).await.unwrap();
    let tags: BTreeSet<String> = [tag.to_string()].into_iter().collect();
    let pushed = self.stage.push_with_tags(&bytes, &tags).await.unwrap();
    assert_eq!(&pushed, digest);
  }

  /// Poll until `environment` has a pending plan.
  pub async fn wait_for_pending(&self, environment: &str) -> PlanId {
    for _ in 0..500 {
      if let Some(id) = self.services().plans.pending(environment).unwrap() {
        return id;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("no pending plan for {} appeared", environment);
  }

  pub fn decide(&self, plan_id: &PlanId, environment: &str, actor: &str, decision: Decision) -> Approval {
    self
      .services()
      .gate
      .record(ApprovalRequest {
        plan_id: plan_id.clone(),
        environment: environment.to_string(),
        actor: actor.to_string(),
        decision,
        comment: None,
      })
      .unwrap()
  }
}

pub fn revision(n: u8) -> SourceRef {
  SourceRef::new(format!("{:02x}", n).repeat(20))
}
