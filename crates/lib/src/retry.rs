//! Bounded exponential backoff for transient failures.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::duration_str;
use crate::error::Classify;

/// How often and how patiently transient operations are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
  /// Total attempts including the first one. Zero is treated as one.
  pub max_attempts: u32,
  #[serde(with = "duration_str")]
  pub initial_delay: Duration,
  #[serde(with = "duration_str")]
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_delay: Duration::from_millis(500),
      max_delay: Duration::from_secs(30),
    }
  }
}

/// The error of the final attempt and how many attempts were made.
#[derive(Debug)]
pub struct Attempted<E> {
  pub attempts: u32,
  pub error: E,
}

impl RetryPolicy {
  /// A policy that never retries.
  pub fn none() -> Self {
    Self {
      max_attempts: 1,
      initial_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  /// Delay before retry number `attempt` (zero-based): `initial * 2^attempt`, capped.
  pub fn backoff_delay(&self, attempt: u32) -> Duration {
    let multiplier = 2u32.saturating_pow(attempt);
    self.initial_delay.saturating_mul(multiplier).min(self.max_delay)
  }

  /// Run `op` until it succeeds, fails with a non-transient error, or attempts run out.
  pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, Attempted<E>>
  where
    E: Classify + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
  {
    let max_attempts = self.max_attempts.max(1);
    let mut attempt = 1;

    loop {
      match op().await {
        Ok(value) => return Ok(value),
        Err(error) if error.is_transient() && attempt < max_attempts => {
          let delay = self.backoff_delay(attempt - 1);
          warn!(
            operation = what,
            attempt,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient failure, retrying"
          );
          tokio::time::sleep(delay).await;
          attempt += 1;
        }
        Err(error) => {
          return Err(Attempted {
            attempts: attempt,
            error,
          });
        }
      }
    }
  }
}
