//! Trigger ingress.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::{Digest, SourceRef};
use crate::plan::PlanId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TriggerKind {
  ChangeProposal,
  Merge,
  ReleaseTag,
  Manual,
}

impl TriggerKind {
  pub fn as_str(self) -> &'static str {
    match self {
      TriggerKind::ChangeProposal => "change-proposal",
      TriggerKind::Merge => "merge",
      TriggerKind::ReleaseTag => "release-tag",
      TriggerKind::Manual => "manual",
    }
  }
}

impl fmt::Display for TriggerKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// What an operator asked for by hand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManualAction {
  Plan {
    digest: Digest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    promoted_from: Option<String>,
  },
  Apply {
    plan_id: PlanId,
  },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "trigger", rename_all = "kebab-case")]
pub enum Trigger {
  ChangeProposal { source: SourceRef },
  Merge { source: SourceRef },
  ReleaseTag { tag: String },
  Manual { environment: String, action: ManualAction },
}

/// An incoming trigger together with the actor who caused it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEvent {
  #[serde(flatten)]
  pub trigger: Trigger,
  pub actor: String,
}

impl TriggerEvent {
  pub fn new(trigger: Trigger, actor: impl Into<String>) -> Self {
    Self {
      trigger,
      actor: actor.into(),
    }
  }

  pub fn kind(&self) -> TriggerKind {
    match self.trigger {
      Trigger::ChangeProposal { .. } => TriggerKind::ChangeProposal,
      Trigger::Merge { .. } => TriggerKind::Merge,
      Trigger::ReleaseTag { .. } => TriggerKind::ReleaseTag,
      Trigger::Manual { .. } => TriggerKind::Manual,
    }
  }
}
