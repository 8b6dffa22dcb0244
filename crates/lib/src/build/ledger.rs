//! Revision -> digest ledger.
//!
//! Stored as a single JSON document keyed by revision. A revision is bound to
//! one digest forever; a divergent rebuild is detected by the caller before
//! anything is written here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::artifact::Digest;
use crate::error::{Classify, FailureKind};
use crate::util::fs::{JsonFileError, read_json, write_json_atomic};

#[derive(Debug, Error)]
pub enum LedgerError {
  #[error(transparent)]
  File(#[from] JsonFileError),

  #[error("revision {revision} is already bound to {recorded}, refusing {digest}")]
  Conflict {
    revision: String,
    recorded: Digest,
    digest: Digest,
  },
}

impl Classify for LedgerError {
  fn kind(&self) -> FailureKind {
    match self {
      LedgerError::File(_) => FailureKind::Storage,
      LedgerError::Conflict { .. } => FailureKind::DivergentBuild,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildEntry {
  pub digest: Digest,
  pub endpoint: String,
  pub built_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
  #[serde(default)]
  builds: BTreeMap<String, BuildEntry>,
}

#[derive(Debug)]
pub struct BuildLedger {
  path: PathBuf,
  // Serializes read-modify-write cycles within this process.
  guard: Mutex<()>,
}

impl BuildLedger {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      guard: Mutex::new(()),
    }
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn lookup(&self, revision: &str) -> Result<Option<BuildEntry>, LedgerError> {
    let file: LedgerFile = read_json(&self.path)?.unwrap_or_default();
    Ok(file.builds.get(revision).cloned())
  }

  /// Bind `revision` to `digest`. Re-recording the same binding is a no-op.
  pub fn record(&self, revision: &str, digest: &Digest, endpoint: &str) -> Result<(), LedgerError> {
    let _guard = self.guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let mut file: LedgerFile = read_json(&self.path)?.unwrap_or_default();

    if let Some(existing) = file.builds.get(revision) {
      if existing.digest == *digest {
        return Ok(());
      }
      return Err(LedgerError::Conflict {
        revision: revision.to_string(),
        recorded: existing.digest.clone(),
        digest: digest.clone(),
      });
    }

    file.builds.insert(
      revision.to_string(),
      BuildEntry {
        digest: digest.clone(),
        endpoint: endpoint.to_string(),
        built_at: Utc::now(),
      },
    );
    write_json_atomic(&self.path, &file)?;
    debug!(revision, digest = %digest, "recorded build");
    Ok(())
  }
}
