//! Approval gate for environments that require a human decision.
//!
//! Approvals are stored per plan as JSON lines. A plan is cleared to apply only
//! when its latest decision is an approval recorded after the plan was
//! computed, and only while it is still the environment's pending plan. An
//! approval for a superseded plan therefore never carries over.

use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::{Classify, FailureKind};
use crate::plan::{Plan, PlanId, PlanStore, PlanStoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
  Approve,
  Reject,
}

impl fmt::Display for Decision {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Decision::Approve => f.write_str("approve"),
      Decision::Reject => f.write_str("reject"),
    }
  }
}

/// An incoming decision, before validation.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
  pub plan_id: PlanId,
  pub environment: String,
  pub actor: String,
  pub decision: Decision,
  pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Approval {
  pub plan_id: PlanId,
  pub environment: String,
  pub actor: String,
  pub decision: Decision,
  pub recorded_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub comment: Option<String>,
}

#[derive(Debug, Error)]
pub enum ApprovalError {
  #[error("plan {plan_id} belongs to {actual}, not {requested}")]
  EnvironmentMismatch {
    plan_id: PlanId,
    requested: String,
    actual: String,
  },

  #[error("plan {plan_id} is not the pending plan for {environment}")]
  NotPending { plan_id: PlanId, environment: String },

  #[error("{environment} does not require approval")]
  NotRequired { environment: String },

  #[error("{approver} may not approve a run triggered by {triggered_by}")]
  SelfReview { approver: String, triggered_by: String },

  #[error("plan {plan_id} was rejected by {actor}")]
  Rejected { plan_id: PlanId, actor: String },

  #[error("no decision for plan {plan_id} within {waited:?}")]
  Timeout { plan_id: PlanId, waited: Duration },

  #[error("wait for approval of plan {plan_id} was cancelled")]
  Cancelled { plan_id: PlanId },

  #[error(transparent)]
  Plan(#[from] PlanStoreError),

  #[error("approval log {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl Classify for ApprovalError {
  fn kind(&self) -> FailureKind {
    match self {
      ApprovalError::EnvironmentMismatch { .. } | ApprovalError::NotRequired { .. } => FailureKind::Configuration,
      ApprovalError::NotPending { .. } => FailureKind::StalePlan,
      ApprovalError::SelfReview { .. } => FailureKind::Forbidden,
      ApprovalError::Rejected { .. } => FailureKind::ApprovalRejected,
      ApprovalError::Timeout { .. } | ApprovalError::Cancelled { .. } => FailureKind::Cancelled,
      ApprovalError::Plan(e) => e.kind(),
      ApprovalError::Io { .. } => FailureKind::Storage,
    }
  }
}

/// Decides whether `approver` may approve a run triggered by `triggered_by`.
#[derive(Clone)]
pub struct ReviewPolicy {
  predicate: Arc<dyn Fn(&str, &str) -> bool + Send + Sync>,
}

impl ReviewPolicy {
  pub fn new(predicate: impl Fn(&str, &str) -> bool + Send + Sync + 'static) -> Self {
    Self {
      predicate: Arc::new(predicate),
    }
  }

  pub fn allow_all() -> Self {
    Self::new(|_, _| true)
  }

  pub fn prevent_self_review() -> Self {
    Self::new(|approver, triggered_by| approver != triggered_by)
  }

  pub fn from_settings(prevent_self_review: bool) -> Self {
    if prevent_self_review {
      Self::prevent_self_review()
    } else {
      Self::allow_all()
    }
  }

  pub fn permits(&self, approver: &str, triggered_by: &str) -> bool {
    (self.predicate)(approver, triggered_by)
  }
}

impl fmt::Debug for ReviewPolicy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ReviewPolicy").finish_non_exhaustive()
  }
}

/// Per-plan JSON-lines approval log.
#[derive(Debug, Clone)]
pub struct ApprovalStore {
  dir: PathBuf,
}

impl ApprovalStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  fn path(&self, plan_id: &PlanId) -> PathBuf {
    self.dir.join(format!("{}.jsonl", plan_id))
  }

  pub fn append(&self, approval: &Approval) -> Result<(), ApprovalError> {
    let path = self.path(&approval.plan_id);
    let io_err = |source| ApprovalError::Io {
      path: path.clone(),
      source,
    };

    let mut line = serde_json::to_string(approval).map_err(|e| io_err(io::Error::other(e)))?;
    line.push('\n');
    fs::create_dir_all(&self.dir).map_err(io_err)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(io_err)?;
    file.write_all(line.as_bytes()).map_err(io_err)?;
    Ok(())
  }

  pub fn list(&self, plan_id: &PlanId) -> Result<Vec<Approval>, ApprovalError> {
    let path = self.path(plan_id);
    let io_err = |source| ApprovalError::Io {
      path: path.clone(),
      source,
    };

    let file = match fs::File::open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(io_err(e)),
    };

    let mut approvals = Vec::new();
    for line in BufReader::new(file).lines() {
      let line = line.map_err(io_err)?;
      if line.trim().is_empty() {
        continue;
      }
      approvals.push(serde_json::from_str(&line).map_err(|e| io_err(io::Error::other(e)))?);
    }
    Ok(approvals)
  }
}

#[derive(Debug, Clone)]
pub struct ApprovalGate {
  store: ApprovalStore,
  plans: PlanStore,
  policy: ReviewPolicy,
  notify: Arc<Notify>,
}

impl ApprovalGate {
  pub fn new(store: ApprovalStore, plans: PlanStore, policy: ReviewPolicy) -> Self {
    Self {
      store,
      plans,
      policy,
      notify: Arc::new(Notify::new()),
    }
  }

  /// Validate and persist a decision, waking any waiter in this process.
  pub fn record(&self, request: ApprovalRequest) -> Result<Approval, ApprovalError> {
    let plan = self.plans.load(&request.plan_id)?;

    if plan.environment() != request.environment {
      return Err(ApprovalError::EnvironmentMismatch {
        plan_id: plan.id,
        requested: request.environment,
        actual: plan.body.environment,
      });
    }
    if !plan.body.requires_approval {
      return Err(ApprovalError::NotRequired {
        environment: request.environment,
      });
    }
    if self.plans.pending(&request.environment)?.as_ref() != Some(&plan.id) {
      return Err(ApprovalError::NotPending {
        plan_id: plan.id,
        environment: request.environment,
      });
    }
    if request.decision == Decision::Approve && !self.policy.permits(&request.actor, &plan.body.triggered_by) {
      return Err(ApprovalError::SelfReview {
        approver: request.actor,
        triggered_by: plan.body.triggered_by,
      });
    }

    let approval = Approval {
      plan_id: plan.id,
      environment: request.environment,
      actor: request.actor,
      decision: request.decision,
      recorded_at: Utc::now(),
      comment: request.comment,
    };
    self.store.append(&approval)?;
    self.notify.notify_waiters();

    info!(
      plan_id = %approval.plan_id,
      environment = %approval.environment,
      actor = %approval.actor,
      decision = %approval.decision,
      "approval recorded"
    );
    Ok(approval)
  }

  /// The latest decision on `plan` that postdates its computation.
  pub fn status(&self, plan: &Plan) -> Result<Option<Approval>, ApprovalError> {
    Ok(
      self
        .store
        .list(&plan.id)?
        .into_iter()
        .filter(|a| a.recorded_at >= plan.body.created_at && a.environment == plan.body.environment)
        .next_back(),
    )
  }

  /// Ok when `plan` holds a fresh approval, `Rejected` on a rejection, `None` otherwise.
  pub fn check(&self, plan: &Plan) -> Result<Option<Approval>, ApprovalError> {
    match self.status(plan)? {
      Some(approval) if approval.decision == Decision::Reject => Err(ApprovalError::Rejected {
        plan_id: plan.id.clone(),
        actor: approval.actor,
      }),
      other => Ok(other),
    }
  }

  /// Block until `plan` is approved, rejected, the timeout elapses or `cancel` fires.
  ///
  /// Wakes on decisions recorded in this process and re-reads the store every
  /// `poll` so decisions recorded by other processes are seen too. A plan that
  /// stops being pending ends the wait with `NotPending`.
  pub async fn wait(
    &self,
    plan: &Plan,
    poll: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
  ) -> Result<Approval, ApprovalError> {
    let deadline = tokio::time::Instant::now() + timeout;
    info!(plan_id = %plan.id, environment = plan.environment(), "waiting for approval");

    loop {
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(approval) = self.check(plan)? {
        return Ok(approval);
      }

      let status = self.plans.status(&plan.id)?.status;
      if status.is_terminal() {
        info!(plan_id = %plan.id, status = %status, "plan left pending while waiting for approval");
        return Err(ApprovalError::NotPending {
          plan_id: plan.id.clone(),
          environment: plan.body.environment.clone(),
        });
      }

      let now = tokio::time::Instant::now();
      if now >= deadline {
        return Err(ApprovalError::Timeout {
          plan_id: plan.id.clone(),
          waited: timeout,
        });
      }

      tokio::select! {
        _ = cancel.cancelled() => {
          return Err(ApprovalError::Cancelled { plan_id: plan.id.clone() });
        }
        _ = &mut notified => debug!(plan_id = %plan.id, "approval signal received"),
        _ = tokio::time::sleep(poll.min(deadline - now)) => {}
      }
    }
  }
}
