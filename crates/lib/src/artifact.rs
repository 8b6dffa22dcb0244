//! Artifact identity: content digests, tag aliases and source references.
//!
//! A [`Digest`] is the only authoritative identity of an artifact. Tags are
//! advisory aliases rendered from per-environment templates.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::consts::{DIGEST_ALGORITHM, SHORT_REVISION_LEN};
use crate::error::{Classify, FailureKind};
use crate::util::hash::hash_bytes;

/// A `sha256:<64 hex>` content digest.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DigestError {
  #[error("digest '{0}' is missing the '{DIGEST_ALGORITHM}:' prefix")]
  MissingAlgorithm(String),

  #[error("digest '{0}' must carry 64 lowercase hex characters")]
  InvalidHex(String),
}

impl Classify for DigestError {
  fn kind(&self) -> FailureKind {
    FailureKind::Configuration
  }
}

impl Digest {
  /// Compute the digest of raw artifact bytes.
  pub fn of(bytes: &[u8]) -> Self {
    Self(format!("{}:{}", DIGEST_ALGORITHM, hash_bytes(bytes)))
  }

  pub fn parse(value: &str) -> Result<Self, DigestError> {
    let hex = value
      .strip_prefix(DIGEST_ALGORITHM)
      .and_then(|rest| rest.strip_prefix(':'))
      .ok_or_else(|| DigestError::MissingAlgorithm(value.to_string()))?;

    let valid = hex.len() == 64 && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
    if !valid {
      return Err(DigestError::InvalidHex(value.to_string()));
    }

    Ok(Self(value.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// The hex part without the algorithm prefix.
  pub fn hex(&self) -> &str {
    &self.0[DIGEST_ALGORITHM.len() + 1..]
  }

  /// A short form for log lines and terminal output.
  pub fn short(&self) -> &str {
    &self.0[..DIGEST_ALGORITHM.len() + 1 + 12]
  }
}

impl fmt::Display for Digest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

impl FromStr for Digest {
  type Err = DigestError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for Digest {
  type Error = DigestError;

  fn try_from(value: String) -> Result<Self, Self::Error> {
    Self::parse(&value)
  }
}

impl From<Digest> for String {
  fn from(value: Digest) -> Self {
    value.0
  }
}

/// A digest together with every tag aliasing it in one registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedArtifact {
  pub digest: Digest,
  pub tags: BTreeSet<String>,
}

/// A source revision to build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
  pub revision: String,
  /// Checked-out source tree, when the build backend needs one.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub path: Option<PathBuf>,
}

impl SourceRef {
  pub fn new(revision: impl Into<String>) -> Self {
    Self {
      revision: revision.into(),
      path: None,
    }
  }

  pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
    self.path = Some(path.into());
    self
  }

  pub fn short_revision(&self) -> &str {
    let end = self
      .revision
      .char_indices()
      .nth(SHORT_REVISION_LEN)
      .map(|(i, _)| i)
      .unwrap_or(self.revision.len());
    &self.revision[..end]
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TagError {
  #[error("tag template '{template}' uses unknown placeholder '{{{placeholder}}}'")]
  UnknownPlaceholder { template: String, placeholder: String },

  #[error("tag template '{template}' has no value for '{{{placeholder}}}' in this context")]
  MissingValue { template: String, placeholder: String },

  #[error("tag template '{0}' has an unterminated placeholder")]
  Unterminated(String),

  #[error("rendered tag '{0}' is not a valid tag")]
  InvalidTag(String),
}

impl Classify for TagError {
  fn kind(&self) -> FailureKind {
    FailureKind::Configuration
  }
}

const PLACEHOLDERS: [&str; 5] = ["revision", "short_revision", "env", "release", "run"];

/// Values available to tag templates.
#[derive(Debug, Clone, Default)]
pub struct TagContext {
  values: BTreeMap<&'static str, String>,
}

impl TagContext {
  pub fn new(environment: &str) -> Self {
    let mut values = BTreeMap::new();
    values.insert("env", environment.to_string());
    Self { values }
  }

  pub fn source(mut self, source: &SourceRef) -> Self {
    self.values.insert("revision", source.revision.clone());
    self.values.insert("short_revision", source.short_revision().to_string());
    self
  }

  pub fn release(mut self, tag: &str) -> Self {
    self.values.insert("release", tag.to_string());
    self
  }

  pub fn run(mut self, run_id: &str) -> Self {
    self.values.insert("run", run_id.to_string());
    self
  }

  /// Render every template. Templates whose placeholder has no value in this
  /// context are skipped (a promotion has no `{revision}`), unknown
  /// placeholders are an error.
  pub fn render_all(&self, templates: &[String]) -> Result<BTreeSet<String>, TagError> {
    let mut tags = BTreeSet::new();
    for template in templates {
      match self.render(template) {
        Ok(tag) => {
          tags.insert(tag);
        }
        Err(TagError::MissingValue { .. }) => continue,
        Err(e) => return Err(e),
      }
    }
    Ok(tags)
  }

  pub fn render(&self, template: &str) -> Result<String, TagError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
      out.push_str(&rest[..start]);
      let after = &rest[start + 1..];
      let end = after
        .find('}')
        .ok_or_else(|| TagError::Unterminated(template.to_string()))?;
      let name = &after[..end];

      if !PLACEHOLDERS.contains(&name) {
        return Err(TagError::UnknownPlaceholder {
          template: template.to_string(),
          placeholder: name.to_string(),
        });
      }
      let value = self.values.get(name).ok_or_else(|| TagError::MissingValue {
        template: template.to_string(),
        placeholder: name.to_string(),
      })?;
      out.push_str(value);
      rest = &after[end + 1..];
    }
    out.push_str(rest);

    validate_tag(&out)?;
    Ok(out)
  }
}

/// OCI tag grammar: `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`.
pub fn validate_tag(tag: &str) -> Result<(), TagError> {
  let mut bytes = tag.bytes();
  let first_ok = bytes.next().is_some_and(|b| b.is_ascii_alphanumeric() || b == b'_');
  let rest_ok = bytes.all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'));
  if first_ok && rest_ok && tag.len() <= 128 {
    Ok(())
  } else {
    Err(TagError::InvalidTag(tag.to_string()))
  }
}
