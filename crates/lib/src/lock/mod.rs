//! Per-environment infrastructure locks.
//!
//! A [`LockManager`] keeps an arena of [`Lease`]s keyed by environment name in
//! a [`LockBackend`]. Planners and appliers hold a lease for the duration of a
//! state read or write; promoters never do.
//!
//! Expired leases are not reclaimed automatically. A holder that crashed may
//! have left the infrastructure half-written, so an operator has to look and
//! then call [`Services::force_unlock`](crate::services::Services::force_unlock),
//! which also records the forced release.

mod file;
mod memory;

pub use file::FileLockBackend;
pub use memory::MemoryLockBackend;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::environment::Environment;
use crate::error::{Classify, FailureKind};
use crate::util::fs::JsonFileError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockId(pub String);

impl LockId {
  pub fn generate() -> Self {
    Self(Uuid::new_v4().to_string())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for LockId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl From<&str> for LockId {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

/// A held lock on one environment's infrastructure state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
  pub lock_id: LockId,
  pub environment: String,
  pub state: String,
  pub holder: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub run_id: Option<String>,
  pub acquired_at: DateTime<Utc>,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    now >= self.expires_at
  }
}

#[derive(Debug, Error)]
pub enum LockError {
  #[error("timed out after {waited:?} waiting for {environment} lock held by {holder} (lock id {lock_id})")]
  Timeout {
    environment: String,
    holder: String,
    lock_id: LockId,
    waited: Duration,
  },

  #[error(
    "{environment} lock {lock_id} held by {holder} expired at {expires_at}; \
     inspect the environment, then run `conveyor force-unlock {environment} --lock-id {lock_id}`"
  )]
  Expired {
    environment: String,
    holder: String,
    lock_id: LockId,
    expires_at: DateTime<Utc>,
  },

  #[error("{environment} is not locked by {lock_id}")]
  NotHeld { environment: String, lock_id: LockId },

  #[error(transparent)]
  File(#[from] JsonFileError),

  #[error("failed to remove lock file: {0}")]
  Remove(#[source] std::io::Error),
}

impl Classify for LockError {
  fn kind(&self) -> FailureKind {
    match self {
      LockError::Timeout { .. } | LockError::Expired { .. } => FailureKind::LockTimeout,
      LockError::NotHeld { .. } => FailureKind::NotFound,
      LockError::File(_) | LockError::Remove(_) => FailureKind::Storage,
    }
  }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug)]
pub enum TryAcquire {
  Acquired,
  Held(Lease),
}

/// Storage for leases. Insertion must be atomic with respect to other callers.
#[async_trait]
pub trait LockBackend: Send + Sync {
  /// Store `lease` unless a lease for its environment already exists.
  async fn try_insert(&self, lease: &Lease) -> Result<TryAcquire, LockError>;

  async fn get(&self, environment: &str) -> Result<Option<Lease>, LockError>;

  /// Remove the environment's lease if it carries `lock_id`.
  async fn remove(&self, environment: &str, lock_id: &LockId) -> Result<Option<Lease>, LockError>;

  async fn list(&self) -> Result<Vec<Lease>, LockError>;
}

#[derive(Debug, Clone)]
pub struct LockSettings {
  pub ttl: Duration,
  pub wait: Duration,
  pub poll: Duration,
}

#[derive(Clone)]
pub struct LockManager {
  backend: Arc<dyn LockBackend>,
  settings: LockSettings,
}

impl LockManager {
  pub fn new(backend: Arc<dyn LockBackend>, settings: LockSettings) -> Self {
    Self { backend, settings }
  }

  /// Acquire `env`'s lease, polling until the configured wait elapses.
  pub async fn acquire(&self, env: &Environment, holder: &str, run_id: Option<&str>) -> Result<Lease, LockError> {
    let started = Instant::now();

    loop {
      let now = Utc::now();
      let ttl = chrono::Duration::from_std(self.settings.ttl).unwrap_or(chrono::Duration::MAX);
      let lease = Lease {
        lock_id: LockId::generate(),
        environment: env.name.clone(),
        state: env.state.clone(),
        holder: holder.to_string(),
        run_id: run_id.map(str::to_string),
        acquired_at: now,
        expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
      };

      let existing = match self.backend.try_insert(&lease).await? {
        TryAcquire::Acquired => {
          debug!(environment = %env.name, lock_id = %lease.lock_id, holder, "lock acquired");
          return Ok(lease);
        }
        TryAcquire::Held(existing) => existing,
      };

      if existing.is_expired(now) {
        warn!(
          environment = %env.name,
          lock_id = %existing.lock_id,
          holder = %existing.holder,
          "found expired lock"
        );
        return Err(LockError::Expired {
          environment: env.name.clone(),
          holder: existing.holder,
          lock_id: existing.lock_id,
          expires_at: existing.expires_at,
        });
      }

      let waited = started.elapsed();
      if waited >= self.settings.wait {
        return Err(LockError::Timeout {
          environment: env.name.clone(),
          holder: existing.holder,
          lock_id: existing.lock_id,
          waited,
        });
      }

      debug!(environment = %env.name, holder = %existing.holder, "lock contended, waiting");
      tokio::time::sleep(self.settings.poll.min(self.settings.wait - waited)).await;
    }
  }

  /// Release a lease held by the caller.
  pub async fn release(&self, lease: &Lease) -> Result<(), LockError> {
    match self.backend.remove(&lease.environment, &lease.lock_id).await? {
      Some(_) => {
        debug!(environment = %lease.environment, lock_id = %lease.lock_id, "lock released");
        Ok(())
      }
      None => Err(LockError::NotHeld {
        environment: lease.environment.clone(),
        lock_id: lease.lock_id.clone(),
      }),
    }
  }

  /// Remove a lease regardless of holder. The id must match the current lease.
  pub async fn force_unlock(&self, environment: &str, lock_id: &LockId) -> Result<Lease, LockError> {
    let removed = self
      .backend
      .remove(environment, lock_id)
      .await?
      .ok_or_else(|| LockError::NotHeld {
        environment: environment.to_string(),
        lock_id: lock_id.clone(),
      })?;
    info!(environment, lock_id = %lock_id, holder = %removed.holder, "lock forcibly removed");
    Ok(removed)
  }

  pub async fn current(&self, environment: &str) -> Result<Option<Lease>, LockError> {
    self.backend.get(environment).await
  }

  pub async fn list(&self) -> Result<Vec<Lease>, LockError> {
    self.backend.list().await
  }
}

impl fmt::Debug for LockManager {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LockManager").field("settings", &self.settings).finish()
  }
}
