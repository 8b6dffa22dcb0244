//! Directory-backed registry.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/
//! ├── tags.json                 # tag -> digest
//! └── blobs/sha256/<hex>        # artifact bytes, named by their digest
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{Registry, RegistryError};
use crate::artifact::{Digest, ResolvedArtifact};
use crate::consts::DIGEST_ALGORITHM;
use crate::util::fs::{JsonFileError, read_json, write_json_atomic};

const TAGS_FILENAME: &str = "tags.json";

#[derive(Debug)]
pub struct LocalRegistry {
  root: PathBuf,
  endpoint: String,
  /// Serializes tag index updates from this process.
  tag_writer: Mutex<()>,
}

impl LocalRegistry {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    let root = root.into();
    let endpoint = root.display().to_string();
    Self {
      root,
      endpoint,
      tag_writer: Mutex::new(()),
    }
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  fn blob_path(&self, digest: &Digest) -> PathBuf {
    self.root.join("blobs").join(DIGEST_ALGORITHM).join(digest.hex())
  }

  fn tags_path(&self) -> PathBuf {
    self.root.join(TAGS_FILENAME)
  }

  fn storage_err(&self, source: io::Error) -> RegistryError {
    RegistryError::Storage {
      endpoint: self.endpoint.clone(),
      source,
    }
  }

  fn index_err(&self, err: JsonFileError) -> RegistryError {
    self.storage_err(io::Error::other(err))
  }

  fn load_tags(&self) -> Result<BTreeMap<String, Digest>, RegistryError> {
    Ok(read_json(&self.tags_path()).map_err(|e| self.index_err(e))?.unwrap_or_default())
  }

  fn read_blob(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    match fs::read(self.blob_path(digest)) {
      Ok(bytes) => Ok(bytes),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RegistryError::NotFound {
        endpoint: self.endpoint.clone(),
        reference: digest.to_string(),
      }),
      Err(e) => Err(self.storage_err(e)),
    }
  }

  fn write_blob(&self, digest: &Digest, bytes: &[u8]) -> Result<(), RegistryError> {
    let path = self.blob_path(digest);
    if path.exists() {
      debug!(digest = %digest, "blob already present");
      return Ok(());
    }

    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| self.storage_err(e))?;
    }

    let temp_path = path.with_extension(format!("{}.tmp", std::process::id()));
    fs::write(&temp_path, bytes).map_err(|e| self.storage_err(e))?;
    fs::rename(&temp_path, &path).map_err(|e| self.storage_err(e))?;
    Ok(())
  }
}

#[async_trait]
impl Registry for LocalRegistry {
  fn endpoint(&self) -> &str {
    &self.endpoint
  }

  async fn pull_by_tag(&self, tag: &str) -> Result<ResolvedArtifact, RegistryError> {
    let tags = self.load_tags()?;
    let digest = tags.get(tag).cloned().ok_or_else(|| RegistryError::NotFound {
      endpoint: self.endpoint.clone(),
      reference: tag.to_string(),
    })?;

    if !self.blob_path(&digest).exists() {
      return Err(RegistryError::NotFound {
        endpoint: self.endpoint.clone(),
        reference: digest.to_string(),
      });
    }

    let aliases = tags
      .iter()
      .filter(|(_, d)| **d == digest)
      .map(|(t, _)| t.clone())
      .collect();

    Ok(ResolvedArtifact { digest, tags: aliases })
  }

  async fn pull_by_digest(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    self.read_blob(digest)
  }

  async fn push_with_tags(&self, bytes: &[u8], tags: &BTreeSet<String>) -> Result<Digest, RegistryError> {
    let digest = Digest::of(bytes);
    self.write_blob(&digest, bytes)?;

    if !tags.is_empty() {
      let _guard = self.tag_writer.lock().await;
      let mut index = self.load_tags()?;
      for tag in tags {
        index.insert(tag.clone(), digest.clone());
      }
      write_json_atomic(&self.tags_path(), &index).map_err(|e| self.index_err(e))?;
    }

    debug!(endpoint = %self.endpoint, digest = %digest, tags = ?tags, "pushed artifact");
    Ok(digest)
  }

  async fn verify_digest(&self, digest: &Digest) -> Result<Digest, RegistryError> {
    let bytes = self.read_blob(digest)?;
    Ok(Digest::of(&bytes))
  }
}
