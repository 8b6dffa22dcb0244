//! Pipeline configuration (`conveyor.toml`).
//!
//! # Example
//!
//! ```toml
//! [pipeline]
//! lease_ttl = "15m"
//! approval_timeout = "24h"
//! prevent_self_review = true
//!
//! [retry]
//! max_attempts = 5
//! initial_delay = "500ms"
//!
//! [[environments]]
//! name = "dev"
//! registry = "registries/dev"
//! state = "state/dev"
//! tags = ["{short_revision}", "dev"]
//!
//! [[environments]]
//! name = "prod"
//! registry = "registries/prod"
//! state = "state/prod"
//! tags = ["{release}", "prod"]
//! requires_approval = true
//!
//! [triggers]
//! change_proposal = { environment = "dev" }
//! merge = { environments = ["dev"] }
//! release_tag = { source = "dev", target = "prod" }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::artifact::{TagContext, TagError};
use crate::environment::Chain;
use crate::error::{Classify, FailureKind};
use crate::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("config file not found: {0}")]
  NotFound(PathBuf),

  #[error("failed to read config {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse config: {0}")]
  Parse(#[from] toml::de::Error),

  #[error("invalid config: {0}")]
  Invalid(String),

  #[error("environment '{environment}' has an invalid tag template: {source}")]
  Tag {
    environment: String,
    #[source]
    source: TagError,
  },
}

impl Classify for ConfigError {
  fn kind(&self) -> FailureKind {
    match self {
      ConfigError::NotFound(_) => FailureKind::NotFound,
      _ => FailureKind::Configuration,
    }
  }
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
  #[serde(default)]
  pub pipeline: PipelineSettings,

  #[serde(default)]
  pub retry: RetryPolicy,

  pub environments: Vec<EnvironmentConfig>,

  #[serde(default)]
  pub triggers: TriggerConfig,

  /// Directory relative endpoints and state handles are resolved against.
  #[serde(skip)]
  pub base_dir: PathBuf,
}

/// Timing and policy knobs for locks and approvals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
  /// How long a lock lease stays valid without release.
  #[serde(with = "duration_str")]
  pub lease_ttl: Duration,

  /// How long to wait for a contended lock before giving up.
  #[serde(with = "duration_str")]
  pub lock_wait: Duration,

  /// Interval between lock acquisition attempts.
  #[serde(with = "duration_str")]
  pub lock_poll: Duration,

  /// Interval between approval re-checks while waiting.
  #[serde(with = "duration_str")]
  pub approval_poll: Duration,

  /// How long a run waits for an approval before it is cancelled.
  #[serde(with = "duration_str")]
  pub approval_timeout: Duration,

  /// Refuse approvals recorded by the actor who triggered the run.
  pub prevent_self_review: bool,
}

impl Default for PipelineSettings {
  fn default() -> Self {
    Self {
      lease_ttl: Duration::from_secs(15 * 60),
      lock_wait: Duration::from_secs(120),
      lock_poll: Duration::from_millis(500),
      approval_poll: Duration::from_secs(10),
      approval_timeout: Duration::from_secs(24 * 60 * 60),
      prevent_self_review: true,
    }
  }
}

/// One deployment target. Order in the file is promotion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnvironmentConfig {
  pub name: String,
  /// Registry endpoint (a directory for the local registry).
  pub registry: String,
  /// Infrastructure state handle (a directory for the local engine).
  pub state: String,
  #[serde(default)]
  pub tags: Vec<String>,
  #[serde(default)]
  pub requires_approval: bool,
  /// Passed over when promoting along the chain.
  #[serde(default)]
  pub skip: bool,
  /// Extra desired-state values forwarded to the infrastructure engine.
  #[serde(default)]
  pub settings: BTreeMap<String, String>,
}

/// Which environments each trigger type drives.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TriggerConfig {
  pub change_proposal: Option<ReviewTrigger>,
  pub merge: Option<DeployTrigger>,
  pub release_tag: Option<ReleaseTrigger>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReviewTrigger {
  pub environment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeployTrigger {
  pub environments: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReleaseTrigger {
  pub source: String,
  pub target: String,
  /// Require every earlier environment to have applied the digest first.
  #[serde(default = "default_true")]
  pub require_chain: bool,
}

fn default_true() -> bool {
  true
}

impl Config {
  /// Load and validate a config file. Relative paths resolve against its directory.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = match fs::read_to_string(path) {
      Ok(content) => content,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ConfigError::NotFound(path.to_path_buf())),
      Err(source) => {
        return Err(ConfigError::Read {
          path: path.to_path_buf(),
          source,
        });
      }
    };

    let base_dir = path
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .map(Path::to_path_buf)
      .unwrap_or_else(|| PathBuf::from("."));
    Self::parse(&content, base_dir)
  }

  pub fn parse(content: &str, base_dir: PathBuf) -> Result<Self, ConfigError> {
    let mut config: Config = toml::from_str(content)?;
    config.base_dir = base_dir;
    config.validate()?;
    Ok(config)
  }

  pub fn chain(&self) -> Chain {
    Chain::from_config(&self.environments)
  }

  /// Resolve an endpoint or state handle against the config directory.
  pub fn resolve_path(&self, value: &str) -> PathBuf {
    let path = Path::new(value);
    if path.is_absolute() {
      path.to_path_buf()
    } else {
      self.base_dir.join(path)
    }
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.environments.is_empty() {
      return Err(ConfigError::Invalid("at least one environment is required".into()));
    }

    let mut names = HashSet::new();
    for env in &self.environments {
      if env.name.is_empty() || !env.name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_') {
        return Err(ConfigError::Invalid(format!("invalid environment name '{}'", env.name)));
      }
      if !names.insert(env.name.as_str()) {
        return Err(ConfigError::Invalid(format!("duplicate environment '{}'", env.name)));
      }
      if env.registry.is_empty() || env.state.is_empty() {
        return Err(ConfigError::Invalid(format!(
          "environment '{}' needs both a registry and a state handle",
          env.name
        )));
      }
      // Render against a context carrying every placeholder so only syntax errors surface.
      let sample = TagContext::new(&env.name)
        .source(&crate::artifact::SourceRef::new("0000000000000000"))
        .release("v0.0.0")
        .run("sample");
      sample.render_all(&env.tags).map_err(|source| ConfigError::Tag {
        environment: env.name.clone(),
        source,
      })?;
    }

    if self.environments.iter().all(|e| e.skip) {
      return Err(ConfigError::Invalid("every environment is marked skip".into()));
    }

    let known = |name: &str, trigger: &str| -> Result<(), ConfigError> {
      if names.contains(name) {
        Ok(())
      } else {
        Err(ConfigError::Invalid(format!(
          "trigger '{}' references unknown environment '{}'",
          trigger, name
        )))
      }
    };

    if let Some(review) = &self.triggers.change_proposal {
      known(&review.environment, "change_proposal")?;
    }

    if let Some(merge) = &self.triggers.merge {
      if merge.environments.is_empty() {
        return Err(ConfigError::Invalid("trigger 'merge' needs at least one environment".into()));
      }
      let chain = self.chain();
      let mut last_position = None;
      for name in &merge.environments {
        known(name, "merge")?;
        let position = chain.get(name).map(|e| e.position);
        if position <= last_position {
          return Err(ConfigError::Invalid(format!(
            "trigger 'merge' must list environments in chain order ('{}' is out of order)",
            name
          )));
        }
        last_position = position;
      }

      // The route covers the head of the non-skipped chain without gaps.
      let deployed: Vec<&str> = merge
        .environments
        .iter()
        .map(String::as_str)
        .filter(|name| chain.get(name).is_some_and(|env| !env.skip))
        .collect();
      let head: Vec<&str> = chain
        .iter()
        .filter(|env| !env.skip)
        .take(deployed.len())
        .map(|env| env.name.as_str())
        .collect();
      if deployed != head {
        return Err(ConfigError::Invalid(format!(
          "trigger 'merge' must deploy the chain in order from its first environment without gaps (expected {})",
          head.join(", ")
        )));
      }
    }

    if let Some(release) = &self.triggers.release_tag {
      known(&release.source, "release_tag")?;
      known(&release.target, "release_tag")?;
      let chain = self.chain();
      let source = chain.get(&release.source).map(|e| e.position);
      let target = chain.get(&release.target).map(|e| e.position);
      if source >= target {
        return Err(ConfigError::Invalid(
          "trigger 'release_tag' must promote forward along the chain".into(),
        ));
      }
    }

    Ok(())
  }
}

/// Serde adapter for humantime duration strings such as `"30s"` or `"15m"`.
pub mod duration_str {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&humantime::format_duration(*value).to_string())
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
  }
}
