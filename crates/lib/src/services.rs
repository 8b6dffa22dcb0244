//! Wiring of every component for one configuration and state root.

use std::sync::Arc;

use thiserror::Error;

use crate::apply::{ApplyContext, Applier};
use crate::approval::{ApprovalGate, ApprovalStore, ReviewPolicy};
use crate::artifact::Digest;
use crate::build::{BuildBackend, BuildLedger, Builder};
use crate::config::Config;
use crate::engine::{InfraEngine, LocalEngine};
use crate::environment::{Chain, Environment};
use crate::error::{Classify, FailureKind};
use crate::lock::{FileLockBackend, Lease, LockBackend, LockError, LockId, LockManager, LockSettings};
use crate::paths::StatePaths;
use crate::plan::{PlanStore, Planner};
use crate::promote::Promoter;
use crate::record::{PromotionRecord, RecordError, RecordEvent, RecordLog};
use crate::registry::{LocalRegistry, Registries, Registry};

#[derive(Debug, Error)]
pub enum ServicesError {
  #[error("unknown environment '{0}'")]
  UnknownEnvironment(String),

  #[error("no registry configured for environment '{0}'")]
  MissingRegistry(String),

  #[error("{environment} has not applied {digest}; promote it through the chain before {target}")]
  ChainIncomplete {
    environment: String,
    target: String,
    digest: Digest,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Record(#[from] RecordError),
}

impl Classify for ServicesError {
  fn kind(&self) -> FailureKind {
    match self {
      ServicesError::Lock(e) => e.kind(),
      ServicesError::Record(e) => e.kind(),
      _ => FailureKind::Configuration,
    }
  }
}

pub struct Services {
  pub config: Config,
  pub chain: Chain,
  pub paths: StatePaths,
  pub registries: Registries,
  pub engine: Arc<dyn InfraEngine>,
  pub locks: LockManager,
  pub plans: PlanStore,
  pub gate: ApprovalGate,
  pub records: Arc<RecordLog>,
  pub builder: Builder,
  pub promoter: Promoter,
  pub planner: Planner,
  pub applier: Applier,
}

impl Services {
  pub fn new(
    config: Config,
    paths: StatePaths,
    registries: Registries,
    engine: Arc<dyn InfraEngine>,
    lock_backend: Arc<dyn LockBackend>,
    build_backend: Arc<dyn BuildBackend>,
  ) -> Self {
    let settings = &config.pipeline;
    let locks = LockManager::new(
      lock_backend,
      LockSettings {
        ttl: settings.lease_ttl,
        wait: settings.lock_wait,
        poll: settings.lock_poll,
      },
    );
    let plans = PlanStore::new(paths.plans());
    let gate = ApprovalGate::new(
      ApprovalStore::new(paths.approvals()),
      plans.clone(),
      ReviewPolicy::from_settings(settings.prevent_self_review),
    );
    let records = Arc::new(RecordLog::new(paths.records()));

    Self {
      chain: config.chain(),
      builder: Builder::new(build_backend, BuildLedger::new(paths.ledger()), config.retry),
      promoter: Promoter::new(config.retry),
      planner: Planner::new(engine.clone(), locks.clone(), plans.clone()),
      applier: Applier::new(engine.clone(), locks.clone(), plans.clone(), gate.clone(), records.clone()),
      config,
      paths,
      registries,
      engine,
      locks,
      plans,
      gate,
      records,
    }
  }

  /// Directory-backed registries and engine, file-based locks.
  pub fn open_local(config: Config, paths: StatePaths, build_backend: Arc<dyn BuildBackend>) -> Self {
    let mut registries = Registries::new();
    for env in &config.environments {
      let registry: Arc<dyn Registry> = Arc::new(LocalRegistry::new(config.resolve_path(&env.registry)));
      registries.insert(env.name.clone(), registry);
    }
    let engine = Arc::new(LocalEngine::new(config.base_dir.clone()));
    let lock_backend = Arc::new(FileLockBackend::new(paths.locks()));
    Self::new(config, paths, registries, engine, lock_backend, build_backend)
  }

  pub fn environment(&self, name: &str) -> Result<&Environment, ServicesError> {
    self
      .chain
      .get(name)
      .ok_or_else(|| ServicesError::UnknownEnvironment(name.to_string()))
  }

  pub fn registry(&self, name: &str) -> Result<Arc<dyn Registry>, ServicesError> {
    self
      .registries
      .get(name)
      .ok_or_else(|| ServicesError::MissingRegistry(name.to_string()))
  }

  /// Every non-skipped environment before `target` must have applied `digest`.
  pub fn check_chain(&self, target: &str, digest: &Digest) -> Result<(), ServicesError> {
    for predecessor in self.chain.predecessors(target) {
      if !self.records.has_applied(&predecessor.name, digest)? {
        return Err(ServicesError::ChainIncomplete {
          environment: predecessor.name.clone(),
          target: target.to_string(),
          digest: digest.clone(),
        });
      }
    }
    Ok(())
  }

  /// Remove a lease by id and record the forced release in the environment's
  /// history. The lock id must match the lease currently held.
  pub async fn force_unlock(
    &self,
    environment: &str,
    lock_id: &LockId,
    actor: &str,
  ) -> Result<(Lease, PromotionRecord), ServicesError> {
    self.environment(environment)?;
    let lease = self.locks.force_unlock(environment, lock_id).await?;
    let record = self.records.append(
      environment,
      actor,
      lease.run_id.as_deref(),
      RecordEvent::ForcedUnlock {
        lock_id: lease.lock_id.clone(),
        holder: lease.holder.clone(),
      },
    )?;
    Ok((lease, record))
  }

  /// An apply context carrying the configured approval timing.
  pub fn apply_context(&self, actor: &str) -> ApplyContext {
    let mut ctx = ApplyContext::new(actor);
    ctx.approval_poll = self.config.pipeline.approval_poll;
    ctx.approval_timeout = self.config.pipeline.approval_timeout;
    ctx
  }
}
