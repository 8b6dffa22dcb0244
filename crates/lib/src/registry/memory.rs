//! In-memory registry, used for tests and single-process simulations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{Registry, RegistryError};
use crate::artifact::{Digest, ResolvedArtifact};

#[derive(Debug, Default)]
struct State {
  blobs: HashMap<Digest, Vec<u8>>,
  tags: BTreeMap<String, Digest>,
}

#[derive(Debug, Clone)]
pub struct MemoryRegistry {
  endpoint: String,
  state: Arc<RwLock<State>>,
}

impl MemoryRegistry {
  pub fn new(endpoint: impl Into<String>) -> Self {
    Self {
      endpoint: endpoint.into(),
      state: Arc::default(),
    }
  }

  /// Number of distinct artifacts stored.
  pub async fn blob_count(&self) -> usize {
    self.state.read().await.blobs.len()
  }

  /// Replace the bytes stored under `digest` without re-hashing them.
  ///
  /// Simulates storage corruption so integrity checks can be exercised.
  pub async fn overwrite_blob(&self, digest: &Digest, bytes: Vec<u8>) {
    self.state.write().await.blobs.insert(digest.clone(), bytes);
  }

  fn not_found(&self, reference: impl Into<String>) -> RegistryError {
    RegistryError::NotFound {
      endpoint: self.endpoint.clone(),
      reference: reference.into(),
    }
  }
}

#[async_trait]
impl Registry for MemoryRegistry {
  fn endpoint(&self) -> &str {
    &self.endpoint
  }

  async fn pull_by_tag(&self, tag: &str) -> Result<ResolvedArtifact, RegistryError> {
    let state = self.state.read().await;
    let digest = state.tags.get(tag).cloned().ok_or_else(|| self.not_found(tag))?;
    let tags = state
      .tags
      .iter()
      .filter(|(_, d)| **d == digest)
      .map(|(t, _)| t.clone())
      .collect();
    Ok(ResolvedArtifact { digest, tags })
  }

  async fn pull_by_digest(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    let state = self.state.read().await;
    state
      .blobs
      .get(digest)
      .cloned()
      .ok_or_else(|| self.not_found(digest.to_string()))
  }

  async fn push_with_tags(&self, bytes: &[u8], tags: &BTreeSet<String>) -> Result<Digest, RegistryError> {
    let digest = Digest::of(bytes);
    let mut state = self.state.write().await;
    state.blobs.entry(digest.clone()).or_insert_with(|| bytes.to_vec());
    for tag in tags {
      state.tags.insert(tag.clone(), digest.clone());
    }
    Ok(digest)
  }

  async fn verify_digest(&self, digest: &Digest) -> Result<Digest, RegistryError> {
    let bytes = self.pull_by_digest(digest).await?;
    Ok(Digest::of(&bytes))
  }
}
