//! Append-only promotion history.
//!
//! One JSON-lines file per target environment. Appends to an environment's log
//! happen while its infrastructure lock is held, so the sequence numbers give a
//! total order per environment. Records are never rewritten or deleted.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::artifact::Digest;
use crate::error::{Classify, FailureKind};
use crate::lock::LockId;
use crate::util::hash::ObjectHash;

#[derive(Debug, Error)]
pub enum RecordError {
  #[error("failed to read promotion log {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to append to promotion log {path}: {source}")]
  Write {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("corrupt entry at {path}:{line}: {source}")]
  Corrupt {
    path: PathBuf,
    line: usize,
    #[source]
    source: serde_json::Error,
  },
}

impl Classify for RecordError {
  fn kind(&self) -> FailureKind {
    FailureKind::Storage
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordEvent {
  /// A digest reached the environment through an applied plan.
  Applied {
    /// Environment the digest was promoted from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
    digest: Digest,
    plan_id: ObjectHash,
  },
  /// An operator removed a lease by hand.
  ForcedUnlock { lock_id: LockId, holder: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromotionRecord {
  pub sequence: u64,
  pub environment: String,
  pub actor: String,
  pub recorded_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_id: Option<String>,
  #[serde(flatten)]
  pub event: RecordEvent,
}

impl PromotionRecord {
  pub fn applied_digest(&self) -> Option<&Digest> {
    match &self.event {
      RecordEvent::Applied { digest, .. } => Some(digest),
      RecordEvent::ForcedUnlock { .. } => None,
    }
  }
}

#[derive(Debug)]
pub struct RecordLog {
  dir: PathBuf,
  append_guard: Mutex<()>,
}

impl RecordLog {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      append_guard: Mutex::new(()),
    }
  }

  fn log_path(&self, environment: &str) -> PathBuf {
    self.dir.join(format!("{}.jsonl", environment))
  }

  /// Append an event and return the stored record.
  pub fn append(
    &self,
    environment: &str,
    actor: &str,
    run_id: Option<&str>,
    event: RecordEvent,
  ) -> Result<PromotionRecord, RecordError> {
    let _guard = self.append_guard.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    let path = self.log_path(environment);
    let sequence = self.history(environment)?.last().map_or(1, |r| r.sequence + 1);

    let record = PromotionRecord {
      sequence,
      environment: environment.to_string(),
      actor: actor.to_string(),
      recorded_at: Utc::now(),
      run_id: run_id.map(str::to_string),
      event,
    };

    let write_err = |source| RecordError::Write {
      path: path.clone(),
      source,
    };
    let mut line = serde_json::to_string(&record).map_err(|e| write_err(io::Error::other(e)))?;
    line.push('\n');

    fs::create_dir_all(&self.dir).map_err(write_err)?;
    let mut file = OpenOptions::new().create(true).append(true).open(&path).map_err(write_err)?;
    file.write_all(line.as_bytes()).map_err(write_err)?;
    file.sync_data().map_err(write_err)?;

    info!(environment, sequence, actor, "recorded promotion event");
    Ok(record)
  }

  /// Every record for `environment`, oldest first.
  pub fn history(&self, environment: &str) -> Result<Vec<PromotionRecord>, RecordError> {
    let path = self.log_path(environment);
    let file = match fs::File::open(&path) {
      Ok(file) => file,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => return Err(RecordError::Read { path, source }),
    };

    let mut records = Vec::new();
    for (index, line) in BufReader::new(file).lines().enumerate() {
      let line = line.map_err(|source| RecordError::Read {
        path: path.clone(),
        source,
      })?;
      if line.trim().is_empty() {
        continue;
      }
      let record = serde_json::from_str(&line).map_err(|source| RecordError::Corrupt {
        path: path.clone(),
        line: index + 1,
        source,
      })?;
      records.push(record);
    }
    Ok(records)
  }

  /// The digest most recently applied to `environment`.
  pub fn current(&self, environment: &str) -> Result<Option<PromotionRecord>, RecordError> {
    Ok(
      self
        .history(environment)?
        .into_iter()
        .rev()
        .find(|r| r.applied_digest().is_some()),
    )
  }

  /// Whether `digest` was ever applied to `environment`.
  pub fn has_applied(&self, environment: &str, digest: &Digest) -> Result<bool, RecordError> {
    Ok(
      self
        .history(environment)?
        .iter()
        .any(|r| r.applied_digest() == Some(digest)),
    )
  }
}
