//! Container registry protocol.
//!
//! The orchestrator needs exactly four primitives from a registry: pull by tag,
//! pull by digest, push with tags, and digest verification on read.

mod local;
mod memory;

pub use local::LocalRegistry;
pub use memory::MemoryRegistry;

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::artifact::{Digest, ResolvedArtifact};
use crate::error::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum RegistryError {
  #[error("{reference} not found in registry {endpoint}")]
  NotFound { endpoint: String, reference: String },

  #[error("registry {endpoint} unavailable: {message}")]
  Unavailable { endpoint: String, message: String },

  /// Expired or rejected short-lived credentials; refreshed on retry.
  #[error("registry {endpoint} rejected credentials: {message}")]
  Unauthorized { endpoint: String, message: String },

  /// The caller is not authorized to write here at all.
  #[error("registry {endpoint} denies access: {message}")]
  Forbidden { endpoint: String, message: String },

  #[error("registry {endpoint} storage error: {source}")]
  Storage {
    endpoint: String,
    #[source]
    source: io::Error,
  },
}

impl Classify for RegistryError {
  fn kind(&self) -> FailureKind {
    match self {
      RegistryError::NotFound { .. } => FailureKind::NotFound,
      RegistryError::Unavailable { .. } | RegistryError::Unauthorized { .. } => FailureKind::RegistryUnavailable,
      RegistryError::Forbidden { .. } => FailureKind::Forbidden,
      RegistryError::Storage { .. } => FailureKind::Storage,
    }
  }
}

#[async_trait]
pub trait Registry: Send + Sync {
  fn endpoint(&self) -> &str;

  /// Resolve a tag to its digest and every tag aliasing that digest.
  async fn pull_by_tag(&self, tag: &str) -> Result<ResolvedArtifact, RegistryError>;

  /// Fetch artifact bytes by digest.
  async fn pull_by_digest(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError>;

  /// Store artifact bytes and point every tag at them. Returns the digest the
  /// registry computed for the stored bytes.
  async fn push_with_tags(&self, bytes: &[u8], tags: &BTreeSet<String>) -> Result<Digest, RegistryError>;

  /// Re-read the stored bytes for `digest` and return the digest they hash to.
  async fn verify_digest(&self, digest: &Digest) -> Result<Digest, RegistryError>;
}

/// Registries keyed by environment name.
#[derive(Clone, Default)]
pub struct Registries {
  by_environment: HashMap<String, Arc<dyn Registry>>,
}

impl Registries {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&mut self, environment: impl Into<String>, registry: Arc<dyn Registry>) {
    self.by_environment.insert(environment.into(), registry);
  }

  pub fn get(&self, environment: &str) -> Option<Arc<dyn Registry>> {
    self.by_environment.get(environment).cloned()
  }
}

impl std::fmt::Debug for Registries {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut map = f.debug_map();
    for (env, registry) in &self.by_environment {
      map.entry(env, &registry.endpoint());
    }
    map.finish()
  }
}
