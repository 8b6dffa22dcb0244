//! Infrastructure engine protocol.
//!
//! The engine owns the resource graph. The orchestrator only hands it a
//! desired state, stores the change set it returns, and asks it to apply that
//! change set later. The live [`Fingerprint`] is how a stored plan is checked
//! against drift.

mod diff;
mod local;

pub use diff::compute_changes;
pub use local::LocalEngine;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::Digest;
use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::util::fs::JsonFileError;

/// Opaque token identifying an environment's live infrastructure state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// What the environment should look like after an apply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
  /// `<registry>@<digest>`.
  pub image: String,
  pub digest: Digest,
  #[serde(default)]
  pub settings: BTreeMap<String, String>,
}

impl DesiredState {
  pub fn for_environment(env: &Environment, digest: &Digest) -> Self {
    Self {
      image: env.image_reference(digest),
      digest: digest.clone(),
      settings: env.settings.clone(),
    }
  }

  /// Flatten into resource address -> value.
  pub fn resources(&self) -> BTreeMap<String, String> {
    let mut resources = BTreeMap::new();
    resources.insert("image".to_string(), self.image.clone());
    for (key, value) in &self.settings {
      resources.insert(format!("setting.{}", key), value.clone());
    }
    resources
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeAction {
  Create,
  Update,
  Delete,
}

impl fmt::Display for ChangeAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let symbol = match self {
      ChangeAction::Create => "create",
      ChangeAction::Update => "update",
      ChangeAction::Delete => "delete",
    };
    f.write_str(symbol)
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceChange {
  pub address: String,
  pub action: ChangeAction,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub before: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub after: Option<String>,
}

/// The engine's answer to a desired state: the live fingerprint it diffed
/// against and the ordered change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnginePlan {
  pub fingerprint: Fingerprint,
  pub changes: Vec<ResourceChange>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyReport {
  /// Addresses applied, in order.
  pub applied: Vec<String>,
  /// Live fingerprint after the apply.
  pub fingerprint: Fingerprint,
}

#[derive(Debug, Error)]
pub enum EngineError {
  #[error("infrastructure state {state} is malformed: {message}")]
  Malformed { state: String, message: String },

  #[error("infrastructure backend for {state} unavailable: {message}")]
  Unavailable { state: String, message: String },

  #[error("apply stopped at {failed} after {} completed change(s): {message}", completed.len())]
  Partial {
    completed: Vec<String>,
    failed: String,
    message: String,
  },

  #[error(transparent)]
  File(#[from] JsonFileError),
}

impl Classify for EngineError {
  fn kind(&self) -> FailureKind {
    match self {
      EngineError::Malformed { .. } => FailureKind::PlanComputation,
      EngineError::Unavailable { .. } | EngineError::File(_) => FailureKind::Storage,
      EngineError::Partial { .. } => FailureKind::PartialApply,
    }
  }
}

#[async_trait]
pub trait InfraEngine: Send + Sync {
  /// Compute the change set that moves `env` to `desired`.
  async fn plan(&self, env: &Environment, desired: &DesiredState) -> Result<EnginePlan, EngineError>;

  /// Apply a previously computed change set, in order.
  async fn apply(&self, env: &Environment, changes: &[ResourceChange]) -> Result<ApplyReport, EngineError>;

  /// Read the live fingerprint. Never cached.
  async fn current_fingerprint(&self, env: &Environment) -> Result<Fingerprint, EngineError>;
}
