//! Environment planner.
//!
//! `Idle -> Computing -> Ready | Failed`. The environment lock is held only
//! while computing: the live fingerprint read, the engine diff and the
//! write-once persist all happen under one lease.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::store::{PlanStore, PlanStoreError};
use super::types::{Plan, PlanBody};
use crate::artifact::Digest;
use crate::engine::{DesiredState, EngineError, InfraEngine};
use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::lock::{LockError, LockManager};
use crate::util::hash::HashError;

#[derive(Debug, Error)]
pub enum PlanError {
  /// Strict resolution: there is no fallback to the previously deployed image.
  #[error("no artifact digest given for {environment}")]
  MissingDigest { environment: String },

  #[error("plan computation for {environment} failed: {source}")]
  Computation {
    environment: String,
    #[source]
    source: EngineError,
  },

  #[error("{environment} state moved from {before} to {after} while planning")]
  StateMoved {
    environment: String,
    before: String,
    after: String,
  },

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Store(#[from] PlanStoreError),

  #[error("failed to hash plan: {0}")]
  Hash(#[source] HashError),
}

impl Classify for PlanError {
  fn kind(&self) -> FailureKind {
    match self {
      PlanError::MissingDigest { .. } => FailureKind::Configuration,
      PlanError::Computation { source, .. } if source.is_transient() => source.kind(),
      PlanError::Computation { .. } | PlanError::StateMoved { .. } => FailureKind::PlanComputation,
      PlanError::Lock(e) => e.kind(),
      PlanError::Store(e) => e.kind(),
      PlanError::Hash(_) => FailureKind::Storage,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannerState {
  Idle,
  Computing,
  Ready,
  Failed,
}

impl fmt::Display for PlannerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      PlannerState::Idle => "idle",
      PlannerState::Computing => "computing",
      PlannerState::Ready => "ready",
      PlannerState::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// Inputs for one plan computation.
#[derive(Debug, Clone)]
pub struct PlanRequest {
  pub digest: Option<Digest>,
  pub promoted_from: Option<String>,
  pub run_id: Option<String>,
  pub actor: String,
}

impl PlanRequest {
  pub fn new(digest: Digest, actor: impl Into<String>) -> Self {
    Self {
      digest: Some(digest),
      promoted_from: None,
      run_id: None,
      actor: actor.into(),
    }
  }

  pub fn promoted_from(mut self, source: impl Into<String>) -> Self {
    self.promoted_from = Some(source.into());
    self
  }

  pub fn run(mut self, run_id: impl Into<String>) -> Self {
    self.run_id = Some(run_id.into());
    self
  }
}

#[derive(Clone)]
pub struct Planner {
  engine: Arc<dyn InfraEngine>,
  locks: LockManager,
  plans: PlanStore,
}

impl Planner {
  pub fn new(engine: Arc<dyn InfraEngine>, locks: LockManager, plans: PlanStore) -> Self {
    Self { engine, locks, plans }
  }

  /// Compute, persist and mark pending a plan for `env`.
  pub async fn plan(&self, env: &Environment, request: &PlanRequest) -> Result<Plan, PlanError> {
    let mut state = PlannerState::Idle;

    let digest = request.digest.clone().ok_or_else(|| PlanError::MissingDigest {
      environment: env.name.clone(),
    })?;

    transition(env, &mut state, PlannerState::Computing);
    let lease = self.locks.acquire(env, &request.actor, request.run_id.as_deref()).await?;
    let result = match (self.compute(env, &digest, request).await, self.locks.release(&lease).await) {
      (Ok(plan), Ok(())) => Ok(plan),
      (Ok(_), Err(e)) => Err(PlanError::Lock(e)),
      (Err(e), released) => {
        if let Err(release_err) = released {
          warn!(environment = %env.name, error = %release_err, "failed to release lock");
        }
        Err(e)
      }
    };

    match result {
      Ok(plan) => {
        transition(env, &mut state, PlannerState::Ready);
        info!(
          environment = %env.name,
          plan_id = %plan.id,
          digest = %plan.digest(),
          changes = plan.body.changes.len(),
          "plan ready"
        );
        Ok(plan)
      }
      Err(e) => {
        transition(env, &mut state, PlannerState::Failed);
        warn!(environment = %env.name, error = %e, "planning failed");
        Err(e)
      }
    }
  }

  async fn compute(&self, env: &Environment, digest: &Digest, request: &PlanRequest) -> Result<Plan, PlanError> {
    let computation = |source| PlanError::Computation {
      environment: env.name.clone(),
      source,
    };

    let fingerprint = self.engine.current_fingerprint(env).await.map_err(computation)?;
    let desired = DesiredState::for_environment(env, digest);
    let engine_plan = self.engine.plan(env, &desired).await.map_err(computation)?;
    if engine_plan.fingerprint != fingerprint {
      return Err(PlanError::StateMoved {
        environment: env.name.clone(),
        before: fingerprint.to_string(),
        after: engine_plan.fingerprint.to_string(),
      });
    }

    let plan = Plan::new(PlanBody {
      environment: env.name.clone(),
      digest: digest.clone(),
      fingerprint,
      changes: engine_plan.changes,
      desired,
      created_at: Utc::now(),
      run_id: request.run_id.clone(),
      triggered_by: request.actor.clone(),
      promoted_from: request.promoted_from.clone(),
      requires_approval: env.requires_approval,
    })
    .map_err(PlanError::Hash)?;

    self.plans.save(&plan)?;
    self.plans.mark_pending(&plan)?;
    Ok(plan)
  }
}

fn transition(env: &Environment, state: &mut PlannerState, next: PlannerState) {
  debug!(environment = %env.name, from = %state, to = %next, "planner transition");
  *state = next;
}
