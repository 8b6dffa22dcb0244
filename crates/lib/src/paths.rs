//! Where conveyor keeps its state.
//!
//! ```text
//! {root}/
//! ├── builds.json          # BuildLedger
//! ├── plans/               # PlanStore
//! ├── approvals/           # ApprovalStore
//! ├── records/             # RecordLog
//! ├── locks/               # FileLockBackend
//! └── runs/                # RunStore
//! ```

use std::path::{Path, PathBuf};

use crate::consts::{APP_NAME, ROOT_ENV_VAR};

/// Returns the user's home directory, or the current directory when unset.
fn home_dir() -> PathBuf {
  std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

/// Returns the directory for data files for the application.
pub fn data_dir() -> PathBuf {
  let data_home = std::env::var("XDG_DATA_HOME")
    .map(PathBuf::from)
    .unwrap_or_else(|_| home_dir().join(".local").join("share"));
  data_home.join(APP_NAME)
}

/// The state root: `CONVEYOR_ROOT` when set, otherwise the data directory.
pub fn root_dir() -> PathBuf {
  match std::env::var(ROOT_ENV_VAR) {
    Ok(root) if !root.is_empty() => PathBuf::from(root),
    _ => data_dir(),
  }
}

#[derive(Debug, Clone)]
pub struct StatePaths {
  root: PathBuf,
}

impl StatePaths {
  pub fn new(root: impl Into<PathBuf>) -> Self {
    Self { root: root.into() }
  }

  pub fn from_env() -> Self {
    Self::new(root_dir())
  }

  pub fn root(&self) -> &Path {
    &self.root
  }

  pub fn ledger(&self) -> PathBuf {
    self.root.join("builds.json")
  }

  pub fn plans(&self) -> PathBuf {
    self.root.join("plans")
  }

  pub fn approvals(&self) -> PathBuf {
    self.root.join("approvals")
  }

  pub fn records(&self) -> PathBuf {
    self.root.join("records")
  }

  pub fn locks(&self) -> PathBuf {
    self.root.join("locks")
  }

  pub fn runs(&self) -> PathBuf {
    self.root.join("runs")
  }
}
