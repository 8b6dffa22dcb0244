//! Deployment environments and the promotion chain.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::artifact::{Digest, TagContext, TagError};
use crate::config::EnvironmentConfig;

/// A statically configured deployment target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
  pub name: String,
  /// Index in the promotion chain.
  pub position: usize,
  pub registry: String,
  pub state: String,
  pub tags: Vec<String>,
  pub requires_approval: bool,
  pub skip: bool,
  pub settings: BTreeMap<String, String>,
}

impl Environment {
  /// The image reference the infrastructure should point at for `digest`.
  pub fn image_reference(&self, digest: &Digest) -> String {
    format!("{}@{}", self.registry, digest)
  }

  /// Render this environment's tag set.
  pub fn render_tags(&self, ctx: &TagContext) -> Result<std::collections::BTreeSet<String>, TagError> {
    ctx.render_all(&self.tags)
  }
}

impl fmt::Display for Environment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.name)
  }
}

/// The ordered promotion chain.
#[derive(Debug, Clone, Default)]
pub struct Chain {
  environments: Vec<Environment>,
}

impl Chain {
  pub fn from_config(configs: &[EnvironmentConfig]) -> Self {
    let environments = configs
      .iter()
      .enumerate()
      .map(|(position, c)| Environment {
        name: c.name.clone(),
        position,
        registry: c.registry.clone(),
        state: c.state.clone(),
        tags: c.tags.clone(),
        requires_approval: c.requires_approval,
        skip: c.skip,
        settings: c.settings.clone(),
      })
      .collect();
    Self { environments }
  }

  pub fn get(&self, name: &str) -> Option<&Environment> {
    self.environments.iter().find(|e| e.name == name)
  }

  pub fn iter(&self) -> impl Iterator<Item = &Environment> {
    self.environments.iter()
  }

  pub fn len(&self) -> usize {
    self.environments.len()
  }

  pub fn is_empty(&self) -> bool {
    self.environments.is_empty()
  }

  /// First environment that is not skipped.
  pub fn first(&self) -> Option<&Environment> {
    self.environments.iter().find(|e| !e.skip)
  }

  /// Last environment that is not skipped.
  pub fn terminal(&self) -> Option<&Environment> {
    self.environments.iter().rev().find(|e| !e.skip)
  }

  /// Non-skipped environments that come before `name` in the chain.
  pub fn predecessors(&self, name: &str) -> Vec<&Environment> {
    match self.get(name) {
      Some(env) => self
        .environments
        .iter()
        .filter(|e| e.position < env.position && !e.skip)
        .collect(),
      None => Vec::new(),
    }
  }

  /// The next non-skipped environment after `name`.
  pub fn next_after(&self, name: &str) -> Option<&Environment> {
    let env = self.get(name)?;
    self.environments.iter().find(|e| e.position > env.position && !e.skip)
  }
}
