mod apply;
mod approve;
mod build;
mod cancel;
mod force_unlock;
mod history;
mod plan;
mod promote;
mod resolve;
mod runs;
mod status;
mod trigger;

pub use apply::cmd_apply;
pub use approve::cmd_approve;
pub use build::cmd_build;
pub use cancel::cmd_cancel;
pub use force_unlock::cmd_force_unlock;
pub use history::cmd_history;
pub use plan::cmd_plan;
pub use promote::cmd_promote;
pub use resolve::cmd_resolve;
pub use runs::cmd_runs;
pub use status::cmd_status;
pub use trigger::{TriggerCommand, cmd_trigger};

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::debug;

use conveyor_lib::apply::ApplyError;
use conveyor_lib::approval::ApprovalError;
use conveyor_lib::artifact::{DigestError, TagError};
use conveyor_lib::build::{BuildError, DirectoryBuilder};
use conveyor_lib::config::{Config, ConfigError};
use conveyor_lib::engine::EngineError;
use conveyor_lib::error::{Classify, FailureKind};
use conveyor_lib::lock::LockError;
use conveyor_lib::paths::StatePaths;
use conveyor_lib::pipeline::{ClaimError, PipelineError, RouteError};
use conveyor_lib::plan::{PlanError, PlanStoreError};
use conveyor_lib::promote::PromoteError;
use conveyor_lib::record::RecordError;
use conveyor_lib::registry::RegistryError;
use conveyor_lib::resolve::ResolveError;
use conveyor_lib::services::{Services, ServicesError};

use crate::output::OutputFormat;

/// Global options shared by every command.
pub struct CmdContext {
  pub config_path: PathBuf,
  pub root: Option<PathBuf>,
  pub actor: String,
  pub format: OutputFormat,
}

impl CmdContext {
  pub fn new(config_path: PathBuf, root: Option<PathBuf>, actor: String, format: OutputFormat) -> Self {
    Self {
      config_path,
      root,
      actor,
      format,
    }
  }

  pub fn json(&self) -> bool {
    self.format.is_json()
  }

  pub fn paths(&self) -> StatePaths {
    match &self.root {
      Some(root) => StatePaths::new(root),
      None => StatePaths::from_env(),
    }
  }

  /// Load the config and wire local registries, engine and file locks.
  pub fn services(&self) -> Result<Services> {
    let config = Config::load(&self.config_path)
      .with_context(|| format!("Failed to load config: {}", self.config_path.display()))?;
    let paths = self.paths();
    debug!(
      config = %self.config_path.display(),
      root = %paths.root().display(),
      environments = config.environments.len(),
      "loaded configuration"
    );
    let builder = Arc::new(DirectoryBuilder::with_root(config.base_dir.clone()));
    Ok(Services::open_local(config, paths, builder))
  }

  pub fn runtime(&self) -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Runtime::new().context("Failed to create async runtime")
  }
}

fn classify(err: &(dyn StdError + 'static)) -> Option<FailureKind> {
  macro_rules! try_kind {
    ($($ty:ty),* $(,)?) => {
      $(
        if let Some(e) = err.downcast_ref::<$ty>() {
          return Some(e.kind());
        }
      )*
    };
  }

  try_kind!(
    PipelineError,
    ClaimError,
    ApplyError,
    PlanError,
    PlanStoreError,
    ApprovalError,
    PromoteError,
    ResolveError,
    BuildError,
    LockError,
    EngineError,
    RegistryError,
    RecordError,
    RouteError,
    ServicesError,
    ConfigError,
    DigestError,
    TagError,
  );
  None
}

/// Exit code for the first classified error in the chain; 1 when nothing in
/// the chain carries a failure kind.
pub fn exit_code(err: &anyhow::Error) -> u8 {
  err
    .chain()
    .find_map(classify)
    .map_or(1, FailureKind::exit_code)
}
