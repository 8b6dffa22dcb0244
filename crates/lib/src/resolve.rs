//! Artifact identity resolution: tag -> digest.

use thiserror::Error;
use tracing::{debug, info};

use crate::artifact::ResolvedArtifact;
use crate::error::{Classify, FailureKind};
use crate::registry::{Registry, RegistryError};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ResolveError {
  #[error("tag '{tag}' does not resolve in {endpoint}")]
  NotFound { endpoint: String, tag: String },

  #[error("registry {endpoint} unavailable after {attempts} attempt(s): {source}")]
  RegistryUnavailable {
    endpoint: String,
    attempts: u32,
    #[source]
    source: RegistryError,
  },

  #[error(transparent)]
  Registry(RegistryError),
}

impl Classify for ResolveError {
  fn kind(&self) -> FailureKind {
    match self {
      ResolveError::NotFound { .. } => FailureKind::NotFound,
      ResolveError::RegistryUnavailable { .. } => FailureKind::RegistryUnavailable,
      ResolveError::Registry(e) => e.kind(),
    }
  }
}

/// Resolve `tag` to the digest it currently points at, with every alias.
///
/// Read-only and idempotent; transport failures are retried per `retry`.
pub async fn resolve(registry: &dyn Registry, tag: &str, retry: &RetryPolicy) -> Result<ResolvedArtifact, ResolveError> {
  debug!(endpoint = registry.endpoint(), tag, "resolving tag");

  let resolved = retry
    .run("resolve", || registry.pull_by_tag(tag))
    .await
    .map_err(|attempted| match attempted.error {
      RegistryError::NotFound { endpoint, .. } => ResolveError::NotFound {
        endpoint,
        tag: tag.to_string(),
      },
      error if error.is_transient() => ResolveError::RegistryUnavailable {
        endpoint: registry.endpoint().to_string(),
        attempts: attempted.attempts,
        source: error,
      },
      error => ResolveError::Registry(error),
    })?;

  info!(tag, digest = %resolved.digest, aliases = resolved.tags.len(), "resolved tag");
  Ok(resolved)
}
