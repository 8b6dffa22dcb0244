//! Cross-registry promotion by digest.
//!
//! Promotion copies bytes, never rebuilds them: pull by digest from the source
//! registry, check the bytes hash to that digest, push them with the target's
//! tags, then read them back from the target and check again.

use std::collections::BTreeSet;

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::Digest;
use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::registry::{Registry, RegistryError};
use crate::retry::{Attempted, RetryPolicy};

#[derive(Debug, Error)]
pub enum PromoteError {
  #[error("registry {endpoint} unavailable after {attempts} attempt(s) during {operation}: {source}")]
  Unavailable {
    endpoint: String,
    operation: &'static str,
    attempts: u32,
    #[source]
    source: RegistryError,
  },

  #[error("digest mismatch at {endpoint} ({stage}): expected {expected}, got {actual}")]
  DigestMismatch {
    endpoint: String,
    stage: &'static str,
    expected: Digest,
    actual: Digest,
  },

  #[error(transparent)]
  Registry(RegistryError),
}

impl Classify for PromoteError {
  fn kind(&self) -> FailureKind {
    match self {
      PromoteError::Unavailable { .. } => FailureKind::RegistryUnavailable,
      PromoteError::DigestMismatch { .. } => FailureKind::DigestMismatch,
      PromoteError::Registry(e) => e.kind(),
    }
  }
}

/// A completed promotion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Promotion {
  pub source: String,
  pub target: String,
  pub digest: Digest,
  pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct Promoter {
  retry: RetryPolicy,
}

impl Promoter {
  pub fn new(retry: RetryPolicy) -> Self {
    Self { retry }
  }

  pub async fn promote(
    &self,
    source_env: &Environment,
    source: &dyn Registry,
    target_env: &Environment,
    target: &dyn Registry,
    digest: &Digest,
    tags: &BTreeSet<String>,
  ) -> Result<Promotion, PromoteError> {
    info!(
      source = %source_env.name,
      target = %target_env.name,
      digest = %digest,
      "promoting artifact"
    );

    let bytes = self
      .retry
      .run("pull", || source.pull_by_digest(digest))
      .await
      .map_err(|a| classify(source.endpoint(), "pull", a))?;
    check(source.endpoint(), "source", digest, Digest::of(&bytes))?;

    let pushed = self
      .retry
      .run("push", || target.push_with_tags(&bytes, tags))
      .await
      .map_err(|a| classify(target.endpoint(), "push", a))?;
    check(target.endpoint(), "push", digest, pushed)?;

    let stored = self
      .retry
      .run("verify", || target.verify_digest(digest))
      .await
      .map_err(|a| classify(target.endpoint(), "verify", a))?;
    check(target.endpoint(), "read-back", digest, stored)?;

    info!(source = %source_env.name, target = %target_env.name, digest = %digest, tags = ?tags, "artifact promoted");
    Ok(Promotion {
      source: source_env.name.clone(),
      target: target_env.name.clone(),
      digest: digest.clone(),
      tags: tags.clone(),
    })
  }
}

fn classify(endpoint: &str, operation: &'static str, attempted: Attempted<RegistryError>) -> PromoteError {
  if attempted.error.is_transient() {
    PromoteError::Unavailable {
      endpoint: endpoint.to_string(),
      operation,
      attempts: attempted.attempts,
      source: attempted.error,
    }
  } else {
    PromoteError::Registry(attempted.error)
  }
}

fn check(endpoint: &str, stage: &'static str, expected: &Digest, actual: Digest) -> Result<(), PromoteError> {
  if actual == *expected {
    return Ok(());
  }
  warn!(endpoint, stage, expected = %expected, actual = %actual, "digest mismatch");
  Err(PromoteError::DigestMismatch {
    endpoint: endpoint.to_string(),
    stage,
    expected: expected.clone(),
    actual,
  })
}
