//! Environment applier.
//!
//! `Pending -> Locking -> Validating -> Applying -> Succeeded | Failed`.
//!
//! Approval is awaited in `Pending`, before the lock is taken, so a plan
//! waiting on a human never blocks other work on the environment. Everything
//! after that happens under one lease: the live fingerprint is re-read and
//! compared, the approval is re-checked, the change set is applied and the
//! promotion record is appended before the lease is released.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalError, ApprovalGate};
use crate::engine::{ApplyReport, EngineError, Fingerprint, InfraEngine};
use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::lock::{Lease, LockError, LockManager};
use crate::plan::{Plan, PlanId, PlanStatus, PlanStore, PlanStoreError};
use crate::record::{PromotionRecord, RecordError, RecordEvent, RecordLog};

#[derive(Debug, Error)]
pub enum ApplyError {
  #[error("plan {plan_id} targets {actual}, not {requested}")]
  WrongEnvironment {
    plan_id: PlanId,
    requested: String,
    actual: String,
  },

  #[error("plan {plan_id} is {status}, only pending plans can be applied")]
  NotPending { plan_id: PlanId, status: PlanStatus },

  #[error("plan {plan_id} for {environment} has no approval yet")]
  AwaitingApproval { plan_id: PlanId, environment: String },

  #[error(
    "plan {plan_id} is stale: {environment} fingerprint was {planned} when planned, is {live} now; re-plan before applying"
  )]
  StalePlan {
    plan_id: PlanId,
    environment: String,
    planned: Fingerprint,
    live: Fingerprint,
  },

  #[error(
    "partial apply of plan {plan_id} on {environment}: {} change(s) applied ({}), failed at {failed}: {message}",
    completed.len(),
    completed.join(", ")
  )]
  Partial {
    plan_id: PlanId,
    environment: String,
    completed: Vec<String>,
    failed: String,
    message: String,
  },

  #[error("apply of plan {plan_id} on {environment} failed: {source}")]
  Engine {
    plan_id: PlanId,
    environment: String,
    #[source]
    source: EngineError,
  },

  #[error(transparent)]
  Approval(#[from] ApprovalError),

  #[error(transparent)]
  Lock(#[from] LockError),

  #[error(transparent)]
  Plan(#[from] PlanStoreError),

  #[error(transparent)]
  Record(#[from] RecordError),
}

impl Classify for ApplyError {
  fn kind(&self) -> FailureKind {
    match self {
      ApplyError::WrongEnvironment { .. } | ApplyError::AwaitingApproval { .. } => FailureKind::Configuration,
      ApplyError::NotPending { .. } | ApplyError::StalePlan { .. } => FailureKind::StalePlan,
      ApplyError::Partial { .. } => FailureKind::PartialApply,
      ApplyError::Engine { source, .. } => source.kind(),
      ApplyError::Approval(e) => e.kind(),
      ApplyError::Lock(e) => e.kind(),
      ApplyError::Plan(e) => e.kind(),
      ApplyError::Record(e) => e.kind(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
  Pending,
  Locking,
  Validating,
  Applying,
  Succeeded,
  Failed,
}

impl fmt::Display for ApplierState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ApplierState::Pending => "pending",
      ApplierState::Locking => "locking",
      ApplierState::Validating => "validating",
      ApplierState::Applying => "applying",
      ApplierState::Succeeded => "succeeded",
      ApplierState::Failed => "failed",
    };
    f.write_str(name)
  }
}

/// Who is applying and how long they will wait for a decision.
#[derive(Debug, Clone)]
pub struct ApplyContext {
  pub actor: String,
  pub run_id: Option<String>,
  /// Wait for a missing approval instead of failing immediately.
  pub wait_for_approval: bool,
  pub approval_poll: Duration,
  pub approval_timeout: Duration,
  pub cancel: CancellationToken,
}

impl ApplyContext {
  pub fn new(actor: impl Into<String>) -> Self {
    Self {
      actor: actor.into(),
      run_id: None,
      wait_for_approval: false,
      approval_poll: Duration::from_secs(10),
      approval_timeout: Duration::from_secs(24 * 60 * 60),
      cancel: CancellationToken::new(),
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct ApplyOutcome {
  pub plan: Plan,
  pub report: ApplyReport,
  pub record: PromotionRecord,
}

#[derive(Clone)]
pub struct Applier {
  engine: Arc<dyn InfraEngine>,
  locks: LockManager,
  plans: PlanStore,
  gate: ApprovalGate,
  records: Arc<RecordLog>,
}

impl Applier {
  pub fn new(
    engine: Arc<dyn InfraEngine>,
    locks: LockManager,
    plans: PlanStore,
    gate: ApprovalGate,
    records: Arc<RecordLog>,
  ) -> Self {
    Self {
      engine,
      locks,
      plans,
      gate,
      records,
    }
  }

  /// Apply stored plan `plan_id` to `env`.
  pub async fn apply(&self, env: &Environment, plan_id: &PlanId, ctx: &ApplyContext) -> Result<ApplyOutcome, ApplyError> {
    let mut state = ApplierState::Pending;
    let result = self.run(env, plan_id, ctx, &mut state).await;

    match &result {
      Ok(outcome) => {
        transition(env, &mut state, ApplierState::Succeeded);
        info!(
          environment = %env.name,
          plan_id = %plan_id,
          digest = %outcome.plan.digest(),
          sequence = outcome.record.sequence,
          "plan applied"
        );
      }
      Err(e) => {
        let failed_in = state;
        transition(env, &mut state, ApplierState::Failed);
        warn!(environment = %env.name, plan_id = %plan_id, state = %failed_in, error = %e, "apply failed");
      }
    }
    result
  }

  async fn run(
    &self,
    env: &Environment,
    plan_id: &PlanId,
    ctx: &ApplyContext,
    state: &mut ApplierState,
  ) -> Result<ApplyOutcome, ApplyError> {
    let plan = self.plans.load(plan_id)?;
    if plan.environment() != env.name {
      return Err(ApplyError::WrongEnvironment {
        plan_id: plan.id,
        requested: env.name.clone(),
        actual: plan.body.environment,
      });
    }
    self.ensure_pending(&plan)?;

    if plan.body.requires_approval {
      self.await_approval(&plan, ctx).await?;
    }

    transition(env, state, ApplierState::Locking);
    let lease = self.locks.acquire(env, &ctx.actor, ctx.run_id.as_deref()).await?;

    let result = self.locked(env, &plan, ctx, &lease, state).await;
    match (result, self.locks.release(&lease).await) {
      (Ok(outcome), Ok(())) => Ok(outcome),
      (Ok(outcome), Err(e)) => {
        // The apply and its record are durable; a stuck lease needs force-unlock.
        error!(environment = %env.name, lock_id = %lease.lock_id, error = %e, "failed to release lock after apply");
        Ok(outcome)
      }
      (Err(e), released) => {
        if let Err(release_err) = released {
          error!(environment = %env.name, lock_id = %lease.lock_id, error = %release_err, "failed to release lock");
        }
        Err(e)
      }
    }
  }

  async fn await_approval(&self, plan: &Plan, ctx: &ApplyContext) -> Result<(), ApplyError> {
    let decision = if ctx.wait_for_approval {
      self
        .gate
        .wait(plan, ctx.approval_poll, ctx.approval_timeout, &ctx.cancel)
        .await
        .map(Some)
    } else {
      self.gate.check(plan)
    };

    match decision {
      Ok(Some(approval)) => {
        debug!(plan_id = %plan.id, approver = %approval.actor, "approval present");
        Ok(())
      }
      Ok(None) => Err(ApplyError::AwaitingApproval {
        plan_id: plan.id.clone(),
        environment: plan.body.environment.clone(),
      }),
      Err(e @ ApprovalError::Rejected { .. }) => {
        self.finish(&plan.id, PlanStatus::Rejected, Some(e.to_string()));
        Err(e.into())
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn locked(
    &self,
    env: &Environment,
    plan: &Plan,
    ctx: &ApplyContext,
    lease: &Lease,
    state: &mut ApplierState,
  ) -> Result<ApplyOutcome, ApplyError> {
    transition(env, state, ApplierState::Validating);
    self.ensure_pending(plan)?;

    let live = self
      .engine
      .current_fingerprint(env)
      .await
      .map_err(|source| ApplyError::Engine {
        plan_id: plan.id.clone(),
        environment: env.name.clone(),
        source,
      })?;
    if live != *plan.fingerprint() {
      let err = ApplyError::StalePlan {
        plan_id: plan.id.clone(),
        environment: env.name.clone(),
        planned: plan.fingerprint().clone(),
        live,
      };
      self.finish(&plan.id, PlanStatus::Stale, Some(err.to_string()));
      return Err(err);
    }

    if plan.body.requires_approval && self.gate.check(plan)?.is_none() {
      return Err(ApplyError::AwaitingApproval {
        plan_id: plan.id.clone(),
        environment: env.name.clone(),
      });
    }

    transition(env, state, ApplierState::Applying);
    debug!(environment = %env.name, lock_id = %lease.lock_id, changes = plan.body.changes.len(), "applying change set");
    let report = match self.engine.apply(env, &plan.body.changes).await {
      Ok(report) => report,
      Err(EngineError::Partial {
        completed,
        failed,
        message,
      }) => {
        let err = ApplyError::Partial {
          plan_id: plan.id.clone(),
          environment: env.name.clone(),
          completed,
          failed,
          message,
        };
        self.finish(&plan.id, PlanStatus::Failed, Some(err.to_string()));
        return Err(err);
      }
      Err(source) => {
        let err = ApplyError::Engine {
          plan_id: plan.id.clone(),
          environment: env.name.clone(),
          source,
        };
        self.finish(&plan.id, PlanStatus::Failed, Some(err.to_string()));
        return Err(err);
      }
    };

    let record = self.records.append(
      &env.name,
      &ctx.actor,
      ctx.run_id.as_deref(),
      RecordEvent::Applied {
        source: plan.body.promoted_from.clone(),
        digest: plan.digest().clone(),
        plan_id: plan.id.clone(),
      },
    )?;
    self.plans.set_status(&plan.id, PlanStatus::Applied, None)?;

    Ok(ApplyOutcome {
      plan: plan.clone(),
      report,
      record,
    })
  }

  fn ensure_pending(&self, plan: &Plan) -> Result<(), ApplyError> {
    let status = self.plans.status(&plan.id)?.status;
    if status != PlanStatus::Pending {
      return Err(ApplyError::NotPending {
        plan_id: plan.id.clone(),
        status,
      });
    }
    Ok(())
  }

  /// Best-effort terminal status; the original error is what the caller sees.
  fn finish(&self, plan_id: &PlanId, status: PlanStatus, reason: Option<String>) {
    if let Err(e) = self.plans.set_status(plan_id, status, reason) {
      warn!(plan_id = %plan_id, status = %status, error = %e, "failed to update plan status");
    }
  }
}

fn transition(env: &Environment, state: &mut ApplierState, next: ApplierState) {
  debug!(environment = %env.name, from = %state, to = %next, "applier transition");
  *state = next;
}
