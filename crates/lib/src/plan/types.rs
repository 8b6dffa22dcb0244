//! Plan types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::artifact::Digest;
use crate::engine::{DesiredState, Fingerprint, ResourceChange};
use crate::util::hash::{HashError, Hashable, ObjectHash};

pub type PlanId = ObjectHash;

/// A computed, write-once change set for one environment and one digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
  pub id: PlanId,
  #[serde(flatten)]
  pub body: PlanBody,
}

/// Everything the plan id is computed over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanBody {
  pub environment: String,
  pub digest: Digest,
  /// Live fingerprint the change set was computed against.
  pub fingerprint: Fingerprint,
  pub changes: Vec<ResourceChange>,
  pub desired: DesiredState,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_id: Option<String>,
  /// Actor whose trigger produced the plan.
  pub triggered_by: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub promoted_from: Option<String>,
  pub requires_approval: bool,
}

impl Hashable for PlanBody {}

impl Plan {
  pub fn new(body: PlanBody) -> Result<Self, HashError> {
    Ok(Self {
      id: body.compute_hash()?,
      body,
    })
  }

  pub fn environment(&self) -> &str {
    &self.body.environment
  }

  pub fn digest(&self) -> &Digest {
    &self.body.digest
  }

  pub fn fingerprint(&self) -> &Fingerprint {
    &self.body.fingerprint
  }

  pub fn is_noop(&self) -> bool {
    self.body.changes.is_empty()
  }
}

/// Lifecycle of a stored plan. The plan itself never changes; only this does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
  Pending,
  Applied,
  Failed,
  Stale,
  Rejected,
  Superseded,
}

impl PlanStatus {
  pub fn is_terminal(self) -> bool {
    !matches!(self, PlanStatus::Pending)
  }

  pub fn can_transition_to(self, next: PlanStatus) -> bool {
    self == PlanStatus::Pending && next != PlanStatus::Pending
  }

  pub fn as_str(self) -> &'static str {
    match self {
      PlanStatus::Pending => "pending",
      PlanStatus::Applied => "applied",
      PlanStatus::Failed => "failed",
      PlanStatus::Stale => "stale",
      PlanStatus::Rejected => "rejected",
      PlanStatus::Superseded => "superseded",
    }
  }
}

impl fmt::Display for PlanStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanStatusRecord {
  pub status: PlanStatus,
  pub updated_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}
