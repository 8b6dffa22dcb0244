//! Hashing utilities for content addressing.
//!
//! This module provides:
//! - `ObjectHash`: A truncated 20-character hash used to address plans and runs
//! - `Hashable`: Content addressing for any serializable value
//! - `hash_bytes()`: Full SHA-256 hex digest

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};

use crate::consts::OBJ_HASH_PREFIX_LEN;

pub type HashError = serde_json::Error;

/// A content-addressed hash identifying a stored object.
///
/// The hash is a 20-character truncated SHA-256 of the JSON-serialized value,
/// short enough to type on the command line.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHash(pub String);

impl ObjectHash {
  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl std::fmt::Display for ObjectHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl From<&str> for ObjectHash {
  fn from(value: &str) -> Self {
    Self(value.to_string())
  }
}

pub trait Hashable: Serialize {
  fn compute_hash(&self) -> Result<ObjectHash, HashError> {
    let serialized = serde_json::to_string(self)?;
    let full = hash_bytes(serialized.as_bytes());
    Ok(ObjectHash(full[..OBJ_HASH_PREFIX_LEN].to_string()))
  }
}

/// Hash arbitrary bytes, returning the 64-character lowercase hex SHA-256.
pub fn hash_bytes(data: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(data);
  hex::encode(hasher.finalize())
}
