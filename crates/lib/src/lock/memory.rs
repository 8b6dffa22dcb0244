//! In-process lease arena.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{Lease, LockBackend, LockError, LockId, TryAcquire};

#[derive(Debug, Default)]
pub struct MemoryLockBackend {
  leases: Mutex<BTreeMap<String, Lease>>,
}

impl MemoryLockBackend {
  pub fn new() -> Self {
    Self::default()
  }
}

#[async_trait]
impl LockBackend for MemoryLockBackend {
  async fn try_insert(&self, lease: &Lease) -> Result<TryAcquire, LockError> {
    let mut leases = self.leases.lock().await;
    if let Some(existing) = leases.get(&lease.environment) {
      return Ok(TryAcquire::Held(existing.clone()));
    }
    leases.insert(lease.environment.clone(), lease.clone());
    Ok(TryAcquire::Acquired)
  }

  async fn get(&self, environment: &str) -> Result<Option<Lease>, LockError> {
    Ok(self.leases.lock().await.get(environment).cloned())
  }

  async fn remove(&self, environment: &str, lock_id: &LockId) -> Result<Option<Lease>, LockError> {
    let mut leases = self.leases.lock().await;
    match leases.get(environment) {
      Some(existing) if existing.lock_id == *lock_id => Ok(leases.remove(environment)),
      _ => Ok(None),
    }
  }

  async fn list(&self) -> Result<Vec<Lease>, LockError> {
    Ok(self.leases.lock().await.values().cloned().collect())
  }
}
