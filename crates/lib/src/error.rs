//! Failure taxonomy shared by every component.
//!
//! Each component error reports a [`FailureKind`]; the kind determines the
//! [`ErrorClass`] (retry policy) and the CLI exit code.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Coarse classes deciding how a failure is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorClass {
  /// Registry/network timeouts and lock contention. Retried with backoff.
  Transient,
  /// Malformed input or missing credentials. Never retried.
  Configuration,
  /// A broken invariant (digest mismatch, stale plan). Never retried.
  Integrity,
  /// The infrastructure engine failed mid-apply. No rollback is attempted.
  PartialApply,
}

impl fmt::Display for ErrorClass {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      ErrorClass::Transient => "transient",
      ErrorClass::Configuration => "configuration",
      ErrorClass::Integrity => "integrity",
      ErrorClass::PartialApply => "partial-apply",
    };
    f.write_str(name)
  }
}

/// Every distinguishable failure, each with its own exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
  Configuration,
  NotFound,
  RegistryUnavailable,
  PushExhausted,
  LockTimeout,
  RunInProgress,
  Build,
  PlanComputation,
  Forbidden,
  DigestMismatch,
  StalePlan,
  DivergentBuild,
  PartialApply,
  ApprovalRejected,
  Cancelled,
  Storage,
}

impl FailureKind {
  pub fn class(self) -> ErrorClass {
    match self {
      FailureKind::RegistryUnavailable
      | FailureKind::PushExhausted
      | FailureKind::LockTimeout
      | FailureKind::RunInProgress
      | FailureKind::Cancelled
      | FailureKind::Storage => ErrorClass::Transient,
      FailureKind::Configuration
      | FailureKind::NotFound
      | FailureKind::Build
      | FailureKind::PlanComputation
      | FailureKind::Forbidden
      | FailureKind::ApprovalRejected => ErrorClass::Configuration,
      FailureKind::DigestMismatch | FailureKind::StalePlan | FailureKind::DivergentBuild => ErrorClass::Integrity,
      FailureKind::PartialApply => ErrorClass::PartialApply,
    }
  }

  /// Process exit code for the CLI. Zero is reserved for success.
  pub fn exit_code(self) -> u8 {
    match self {
      FailureKind::Configuration => 2,
      FailureKind::NotFound => 3,
      FailureKind::RegistryUnavailable => 10,
      FailureKind::PushExhausted => 11,
      FailureKind::LockTimeout => 12,
      FailureKind::RunInProgress => 13,
      FailureKind::Build => 20,
      FailureKind::PlanComputation => 21,
      FailureKind::Forbidden => 22,
      FailureKind::DigestMismatch => 30,
      FailureKind::StalePlan => 31,
      FailureKind::DivergentBuild => 32,
      FailureKind::PartialApply => 40,
      FailureKind::ApprovalRejected => 50,
      FailureKind::Cancelled => 51,
      FailureKind::Storage => 60,
    }
  }

  pub fn as_str(self) -> &'static str {
    match self {
      FailureKind::Configuration => "configuration",
      FailureKind::NotFound => "not-found",
      FailureKind::RegistryUnavailable => "registry-unavailable",
      FailureKind::PushExhausted => "push-exhausted",
      FailureKind::LockTimeout => "lock-timeout",
      FailureKind::RunInProgress => "run-in-progress",
      FailureKind::Build => "build",
      FailureKind::PlanComputation => "plan-computation",
      FailureKind::Forbidden => "forbidden",
      FailureKind::DigestMismatch => "digest-mismatch",
      FailureKind::StalePlan => "stale-plan",
      FailureKind::DivergentBuild => "divergent-build",
      FailureKind::PartialApply => "partial-apply",
      FailureKind::ApprovalRejected => "approval-rejected",
      FailureKind::Cancelled => "cancelled",
      FailureKind::Storage => "storage",
    }
  }
}

impl fmt::Display for FailureKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Implemented by every component error so callers can classify it.
pub trait Classify {
  fn kind(&self) -> FailureKind;

  fn class(&self) -> ErrorClass {
    self.kind().class()
  }

  fn is_transient(&self) -> bool {
    self.class() == ErrorClass::Transient
  }
}
