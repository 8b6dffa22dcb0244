//! Cross-process leases: one JSON file per environment, created exclusively.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Lease, LockBackend, LockError, LockId, TryAcquire};
use crate::util::fs::{JsonFileError, create_json_exclusive, read_json};

#[derive(Debug)]
pub struct FileLockBackend {
  dir: PathBuf,
  // Serializes check-then-remove within this process.
  remove_guard: Mutex<()>,
}

impl FileLockBackend {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self {
      dir: dir.into(),
      remove_guard: Mutex::new(()),
    }
  }

  fn lease_path(&self, environment: &str) -> PathBuf {
    self.dir.join(format!("{}.json", environment))
  }
}

fn read_lease(path: &Path) -> Result<Option<Lease>, LockError> {
  Ok(read_json(path)?)
}

#[async_trait]
impl LockBackend for FileLockBackend {
  async fn try_insert(&self, lease: &Lease) -> Result<TryAcquire, LockError> {
    let path = self.lease_path(&lease.environment);
    if create_json_exclusive(&path, lease)? {
      return Ok(TryAcquire::Acquired);
    }

    // The holder may have released between our create and read; report it as
    // held anyway and let the caller poll again.
    match read_lease(&path) {
      Ok(Some(existing)) => Ok(TryAcquire::Held(existing)),
      Ok(None) | Err(LockError::File(JsonFileError::Parse { .. })) => Ok(TryAcquire::Held(Lease {
        expires_at: lease.acquired_at + chrono::Duration::days(1),
        holder: "<unknown>".to_string(),
        lock_id: LockId::from("<unreadable>"),
        ..lease.clone()
      })),
      Err(e) => Err(e),
    }
  }

  async fn get(&self, environment: &str) -> Result<Option<Lease>, LockError> {
    read_lease(&self.lease_path(environment))
  }

  async fn remove(&self, environment: &str, lock_id: &LockId) -> Result<Option<Lease>, LockError> {
    let _guard = self.remove_guard.lock().await;
    let path = self.lease_path(environment);
    let Some(existing) = read_lease(&path)? else {
      return Ok(None);
    };
    if existing.lock_id != *lock_id {
      return Ok(None);
    }
    match fs::remove_file(&path) {
      Ok(()) => Ok(Some(existing)),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(LockError::Remove(e)),
    }
  }

  async fn list(&self) -> Result<Vec<Lease>, LockError> {
    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(LockError::Remove(e)),
    };

    let mut leases = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json")
        && let Some(lease) = read_lease(&path)?
      {
        leases.push(lease);
      }
    }
    leases.sort_by(|a, b| a.environment.cmp(&b.environment));
    Ok(leases)
  }
}
