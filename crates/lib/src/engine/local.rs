//! Directory-backed infrastructure engine.
//!
//! Each environment's state handle is a directory holding `infra.json`: a
//! serial number and a flat resource map. The fingerprint covers both, so any
//! write to the state (ours or out-of-band) invalidates older plans.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::diff::compute_changes;
use super::{ApplyReport, ChangeAction, DesiredState, EngineError, EnginePlan, Fingerprint, InfraEngine, ResourceChange};
use crate::environment::Environment;
use crate::util::fs::{read_json, write_json_atomic};
use crate::util::hash::hash_bytes;

const STATE_FILENAME: &str = "infra.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfraState {
  pub serial: u64,
  #[serde(default)]
  pub resources: BTreeMap<String, String>,
}

impl InfraState {
  fn fingerprint(&self) -> Result<Fingerprint, EngineError> {
    let bytes = serde_json::to_vec(self).map_err(|e| EngineError::Malformed {
      state: String::new(),
      message: e.to_string(),
    })?;
    Ok(Fingerprint(format!("{}-{}", self.serial, &hash_bytes(&bytes)[..16])))
  }
}

#[derive(Debug, Clone)]
pub struct LocalEngine {
  base_dir: PathBuf,
}

impl LocalEngine {
  /// Relative state handles are resolved against `base_dir`.
  pub fn new(base_dir: impl Into<PathBuf>) -> Self {
    Self {
      base_dir: base_dir.into(),
    }
  }

  pub fn state_path(&self, env: &Environment) -> PathBuf {
    let handle = Path::new(&env.state);
    let dir = if handle.is_absolute() {
      handle.to_path_buf()
    } else {
      self.base_dir.join(handle)
    };
    dir.join(STATE_FILENAME)
  }

  pub fn load(&self, env: &Environment) -> Result<InfraState, EngineError> {
    Ok(read_json(&self.state_path(env))?.unwrap_or_default())
  }

  /// Write one resource directly, bypassing plan/apply.
  ///
  /// This is what an operator editing infrastructure by hand looks like to us.
  pub fn set_resource(&self, env: &Environment, address: &str, value: &str) -> Result<Fingerprint, EngineError> {
    let mut state = self.load(env)?;
    state.serial += 1;
    state.resources.insert(address.to_string(), value.to_string());
    write_json_atomic(&self.state_path(env), &state)?;
    state.fingerprint()
  }
}

#[async_trait]
impl InfraEngine for LocalEngine {
  async fn plan(&self, env: &Environment, desired: &DesiredState) -> Result<EnginePlan, EngineError> {
    let state = self.load(env)?;
    let changes = compute_changes(&state.resources, &desired.resources());
    debug!(environment = %env.name, changes = changes.len(), "computed change set");
    Ok(EnginePlan {
      fingerprint: state.fingerprint()?,
      changes,
    })
  }

  async fn apply(&self, env: &Environment, changes: &[ResourceChange]) -> Result<ApplyReport, EngineError> {
    let path = self.state_path(env);
    let mut state = self.load(env)?;
    let mut applied = Vec::with_capacity(changes.len());

    if !changes.is_empty() {
      state.serial += 1;
    }

    for change in changes {
      let live = state.resources.get(&change.address);
      if live != change.before.as_ref() {
        return Err(EngineError::Partial {
          completed: applied,
          failed: change.address.clone(),
          message: format!(
            "live value {:?} does not match planned value {:?}",
            live, change.before
          ),
        });
      }

      match (change.action, &change.after) {
        (ChangeAction::Delete, _) => {
          state.resources.remove(&change.address);
        }
        (_, Some(after)) => {
          state.resources.insert(change.address.clone(), after.clone());
        }
        (action, None) => {
          return Err(EngineError::Partial {
            completed: applied,
            failed: change.address.clone(),
            message: format!("{} change carries no value", action),
          });
        }
      }

      if let Err(e) = write_json_atomic(&path, &state) {
        return Err(EngineError::Partial {
          completed: applied,
          failed: change.address.clone(),
          message: e.to_string(),
        });
      }
      applied.push(change.address.clone());
    }

    let fingerprint = state.fingerprint()?;
    info!(environment = %env.name, applied = applied.len(), fingerprint = %fingerprint, "applied change set");
    Ok(ApplyReport { applied, fingerprint })
  }

  async fn current_fingerprint(&self, env: &Environment) -> Result<Fingerprint, EngineError> {
    self.load(env)?.fingerprint()
  }
}
