//! Per-run state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::FailureKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "environment", rename_all = "snake_case")]
pub enum RunState {
  Triggered,
  Building,
  Resolving,
  Promoting(String),
  Planning(String),
  Approving(String),
  Applying(String),
  Completed,
  PlannedForReview,
  Failed,
  Cancelled,
}

impl RunState {
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      RunState::Completed | RunState::PlannedForReview | RunState::Failed | RunState::Cancelled
    )
  }

  /// Terminal state for a run that stopped with `kind`.
  pub fn for_failure(kind: FailureKind) -> Self {
    match kind {
      FailureKind::Cancelled => RunState::Cancelled,
      _ => RunState::Failed,
    }
  }

  pub fn environment(&self) -> Option<&str> {
    match self {
      RunState::Promoting(env) | RunState::Planning(env) | RunState::Approving(env) | RunState::Applying(env) => {
        Some(env)
      }
      _ => None,
    }
  }
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::Triggered => f.write_str("triggered"),
      RunState::Building => f.write_str("building"),
      RunState::Resolving => f.write_str("resolving"),
      RunState::Promoting(env) => write!(f, "promoting({})", env),
      RunState::Planning(env) => write!(f, "planning({})", env),
      RunState::Approving(env) => write!(f, "approving({})", env),
      RunState::Applying(env) => write!(f, "applying({})", env),
      RunState::Completed => f.write_str("completed"),
      RunState::PlannedForReview => f.write_str("planned_for_review"),
      RunState::Failed => f.write_str("failed"),
      RunState::Cancelled => f.write_str("cancelled"),
    }
  }
}
