//! Test utilities for conveyor-lib.
//!
//! Fakes for the external interfaces plus small constructors for domain values.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::artifact::{Digest, ResolvedArtifact, SourceRef};
use crate::build::BuildBackend;
use crate::engine::{DesiredState, Fingerprint};
use crate::environment::Environment;
use crate::plan::{Plan, PlanBody};
use crate::registry::{Registry, RegistryError};
use crate::retry::RetryPolicy;

/// Three attempts with millisecond delays.
pub fn fast_retry() -> RetryPolicy {
  RetryPolicy {
    max_attempts: 3,
    initial_delay: Duration::from_millis(1),
    max_delay: Duration::from_millis(2),
  }
}

pub fn sample_environment(name: &str, position: usize) -> Environment {
  Environment {
    name: name.to_string(),
    position,
    registry: format!("registries/{}", name),
    state: format!("state/{}", name),
    tags: vec![name.to_string()],
    requires_approval: false,
    skip: false,
    settings: BTreeMap::new(),
  }
}

pub fn sample_plan(environment: &str, digest: &Digest) -> Plan {
  let image = format!("registries/{}@{}", environment, digest);
  let body = PlanBody {
    environment: environment.to_string(),
    digest: digest.clone(),
    fingerprint: Fingerprint("0-0000000000000000".to_string()),
    changes: Vec::new(),
    desired: DesiredState {
      image,
      digest: digest.clone(),
      settings: BTreeMap::new(),
    },
    created_at: Utc::now(),
    run_id: None,
    triggered_by: "ci".to_string(),
    promoted_from: None,
    requires_approval: false,
  };
  Plan::new(body).unwrap()
}

/// A build backend returning fixed bytes or a fixed error.
pub struct StaticBackend {
  result: Result<Vec<u8>, String>,
}

impl StaticBackend {
  pub fn new(bytes: &[u8]) -> Self {
    Self {
      result: Ok(bytes.to_vec()),
    }
  }

  pub fn failing(message: &str) -> Self {
    Self {
      result: Err(message.to_string()),
    }
  }
}

#[async_trait]
impl BuildBackend for StaticBackend {
  async fn build(&self, _source: &SourceRef) -> Result<Vec<u8>, String> {
    self.result.clone()
  }
}

/// Wraps a registry and injects failures.
pub struct FlakyRegistry<R> {
  inner: R,
  pull_failures: AtomicU32,
  push_failures: AtomicU32,
  expired_credentials: AtomicU32,
  forbid_pushes: bool,
  rewrite_pushes: bool,
}

impl<R: Registry> FlakyRegistry<R> {
  pub fn new(inner: R) -> Self {
    Self {
      inner,
      pull_failures: AtomicU32::new(0),
      push_failures: AtomicU32::new(0),
      expired_credentials: AtomicU32::new(0),
      forbid_pushes: false,
      rewrite_pushes: false,
    }
  }

  /// The next `n` pulls fail as unavailable.
  pub fn fail_pulls(self, n: u32) -> Self {
    self.pull_failures.store(n, Ordering::SeqCst);
    self
  }

  /// The next `n` pushes fail as unavailable.
  pub fn fail_pushes(self, n: u32) -> Self {
    self.push_failures.store(n, Ordering::SeqCst);
    self
  }

  /// The next `n` pushes are rejected for expired credentials.
  pub fn expire_credentials(self, n: u32) -> Self {
    self.expired_credentials.store(n, Ordering::SeqCst);
    self
  }

  /// Every push is denied.
  pub fn forbid_pushes(mut self) -> Self {
    self.forbid_pushes = true;
    self
  }

  /// Pushes report the digest of different bytes than the ones sent.
  pub fn rewrite_pushes(mut self) -> Self {
    self.rewrite_pushes = true;
    self
  }

  fn take(counter: &AtomicU32) -> bool {
    counter
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
      .is_ok()
  }

  fn unavailable(&self) -> RegistryError {
    RegistryError::Unavailable {
      endpoint: self.inner.endpoint().to_string(),
      message: "connection reset".to_string(),
    }
  }
}

#[async_trait]
impl<R: Registry> Registry for FlakyRegistry<R> {
  fn endpoint(&self) -> &str {
    self.inner.endpoint()
  }

  async fn pull_by_tag(&self, tag: &str) -> Result<ResolvedArtifact, RegistryError> {
    if Self::take(&self.pull_failures) {
      return Err(self.unavailable());
    }
    self.inner.pull_by_tag(tag).await
  }

  async fn pull_by_digest(&self, digest: &Digest) -> Result<Vec<u8>, RegistryError> {
    if Self::take(&self.pull_failures) {
      return Err(self.unavailable());
    }
    self.inner.pull_by_digest(digest).await
  }

  async fn push_with_tags(&self, bytes: &[u8], tags: &BTreeSet<String>) -> Result<Digest, RegistryError> {
    if self.forbid_pushes {
      return Err(RegistryError::Forbidden {
        endpoint: self.inner.endpoint().to_string(),
        message: "no cross-registry grant".to_string(),
      });
    }
    if Self::take(&self.expired_credentials) {
      return Err(RegistryError::Unauthorized {
        endpoint: self.inner.endpoint().to_string(),
        message: "token expired".to_string(),
      });
    }
    if Self::take(&self.push_failures) {
      return Err(self.unavailable());
    }
    if self.rewrite_pushes {
      let mut altered = bytes.to_vec();
      altered.push(0);
      return self.inner.push_with_tags(&altered, tags).await;
    }
    self.inner.push_with_tags(bytes, tags).await
  }

  async fn verify_digest(&self, digest: &Digest) -> Result<Digest, RegistryError> {
    self.inner.verify_digest(digest).await
  }
}
