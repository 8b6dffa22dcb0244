//! Artifact builds.
//!
//! A [`Builder`] turns a source revision into artifact bytes exactly once per
//! run, pushes them to the first environment's registry, and records the
//! revision -> digest binding in the [`BuildLedger`]. Only the push is retried;
//! the bytes are never rebuilt during a retry, so a retried push cannot yield a
//! second digest for the same revision.

mod directory;
mod ledger;

pub use directory::DirectoryBuilder;
pub use ledger::{BuildEntry, BuildLedger, LedgerError};

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::artifact::{Digest, SourceRef};
use crate::error::{Classify, FailureKind};
use crate::registry::{Registry, RegistryError};
use crate::retry::RetryPolicy;

/// Produces artifact bytes from source. The toolchain itself is external.
#[async_trait]
pub trait BuildBackend: Send + Sync {
  async fn build(&self, source: &SourceRef) -> Result<Vec<u8>, String>;
}

#[derive(Debug, Error)]
pub enum BuildError {
  /// The toolchain failed. The message is surfaced verbatim.
  #[error("build of {revision} failed: {message}")]
  Build { revision: String, message: String },

  #[error("push to {endpoint} failed after {attempts} attempt(s): {source}")]
  PushExhausted {
    endpoint: String,
    attempts: u32,
    #[source]
    source: RegistryError,
  },

  #[error("push to {endpoint} failed: {source}")]
  Push {
    endpoint: String,
    #[source]
    source: RegistryError,
  },

  #[error("registry {endpoint} stored digest {actual}, expected {expected}")]
  DigestMismatch {
    endpoint: String,
    expected: Digest,
    actual: Digest,
  },

  #[error("revision {revision} was already built as {recorded}, rebuild produced {produced}")]
  Divergent {
    revision: String,
    recorded: Digest,
    produced: Digest,
  },

  #[error(transparent)]
  Ledger(#[from] LedgerError),
}

impl Classify for BuildError {
  fn kind(&self) -> FailureKind {
    match self {
      BuildError::Build { .. } => FailureKind::Build,
      BuildError::PushExhausted { .. } => FailureKind::PushExhausted,
      BuildError::Push { source, .. } => source.kind(),
      BuildError::DigestMismatch { .. } => FailureKind::DigestMismatch,
      BuildError::Divergent { .. } => FailureKind::DivergentBuild,
      BuildError::Ledger(e) => e.kind(),
    }
  }
}

/// The result of a successful build.
#[derive(Debug, Clone, Serialize)]
pub struct BuildOutput {
  pub revision: String,
  pub digest: Digest,
  pub tags: BTreeSet<String>,
  /// The ledger already held this revision with the same digest.
  pub reused: bool,
}

pub struct Builder {
  backend: Arc<dyn BuildBackend>,
  ledger: BuildLedger,
  retry: RetryPolicy,
}

impl Builder {
  pub fn new(backend: Arc<dyn BuildBackend>, ledger: BuildLedger, retry: RetryPolicy) -> Self {
    Self { backend, ledger, retry }
  }

  pub fn ledger(&self) -> &BuildLedger {
    &self.ledger
  }

  /// Build `source` and push it to `registry` with `tags`.
  pub async fn build(
    &self,
    source: &SourceRef,
    registry: &dyn Registry,
    tags: &BTreeSet<String>,
  ) -> Result<BuildOutput, BuildError> {
    info!(revision = %source.revision, endpoint = registry.endpoint(), "building artifact");

    let bytes = self.backend.build(source).await.map_err(|message| BuildError::Build {
      revision: source.revision.clone(),
      message,
    })?;
    let expected = Digest::of(&bytes);

    let recorded = self.ledger.lookup(&source.revision)?;
    if let Some(entry) = &recorded
      && entry.digest != expected
    {
      warn!(
        revision = %source.revision,
        recorded = %entry.digest,
        produced = %expected,
        "rebuild is not reproducible"
      );
      return Err(BuildError::Divergent {
        revision: source.revision.clone(),
        recorded: entry.digest.clone(),
        produced: expected,
      });
    }

    let endpoint = registry.endpoint().to_string();
    let pushed = self
      .retry
      .run("push", || registry.push_with_tags(&bytes, tags))
      .await
      .map_err(|attempted| {
        if attempted.error.is_transient() {
          BuildError::PushExhausted {
            endpoint: endpoint.clone(),
            attempts: attempted.attempts,
            source: attempted.error,
          }
        } else {
          BuildError::Push {
            endpoint: endpoint.clone(),
            source: attempted.error,
          }
        }
      })?;

    if pushed != expected {
      return Err(BuildError::DigestMismatch {
        endpoint,
        expected,
        actual: pushed,
      });
    }

    self.ledger.record(&source.revision, &expected, &endpoint)?;
    info!(revision = %source.revision, digest = %expected, tags = ?tags, "artifact built");

    Ok(BuildOutput {
      revision: source.revision.clone(),
      digest: expected,
      tags: tags.clone(),
      reused: recorded.is_some(),
    })
  }
}
