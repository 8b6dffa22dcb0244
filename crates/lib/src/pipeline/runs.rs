//! Run bookkeeping: persisted run summaries and the registry of in-flight runs
//! used for cancellation.
//!
//! ```text
//! runs/
//! ├── {run_id}.json        # RunRecord
//! ├── registry.lock        # held while claims change
//! ├── active/              # {trigger}.{environment}.json claims
//! └── cancel/              # {run_id}.json cancel requests
//! ```

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::route::{Route, RunKey};
use super::state::RunState;
use super::trigger::TriggerKind;
use crate::artifact::Digest;
use crate::error::{Classify, FailureKind};
use crate::plan::PlanId;
use crate::util::fs::{JsonFileError, create_json_exclusive, read_json, write_json_atomic};

pub fn generate_run_id() -> String {
  Uuid::new_v4().simple().to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRef {
  pub environment: String,
  pub plan_id: PlanId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunFailure {
  pub kind: FailureKind,
  pub stage: String,
  pub message: String,
}

/// Durable summary of one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
  pub run_id: String,
  pub trigger: TriggerKind,
  pub route: Route,
  pub actor: String,
  pub state: RunState,
  pub started_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub finished_at: Option<DateTime<Utc>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub digest: Option<Digest>,
  #[serde(default)]
  pub plans: Vec<PlanRef>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub failure: Option<RunFailure>,
}

impl RunRecord {
  pub fn new(run_id: String, trigger: TriggerKind, route: Route, actor: String) -> Self {
    Self {
      run_id,
      trigger,
      route,
      actor,
      state: RunState::Triggered,
      started_at: Utc::now(),
      finished_at: None,
      digest: None,
      plans: Vec::new(),
      failure: None,
    }
  }

  pub fn plan_for(&self, environment: &str) -> Option<&PlanId> {
    self
      .plans
      .iter()
      .rev()
      .find(|p| p.environment == environment)
      .map(|p| &p.plan_id)
  }
}

#[derive(Debug, Clone)]
pub struct RunStore {
  dir: PathBuf,
}

impl RunStore {
  pub fn new(dir: impl Into<PathBuf>) -> Self {
    Self { dir: dir.into() }
  }

  fn path(&self, run_id: &str) -> PathBuf {
    self.dir.join(format!("{}.json", run_id))
  }

  pub fn save(&self, record: &RunRecord) -> Result<(), JsonFileError> {
    write_json_atomic(&self.path(&record.run_id), record)
  }

  pub fn load(&self, run_id: &str) -> Result<Option<RunRecord>, JsonFileError> {
    read_json(&self.path(run_id))
  }

  /// Every stored run, newest first.
  pub fn list(&self) -> Result<Vec<RunRecord>, JsonFileError> {
    let entries = match fs::read_dir(&self.dir) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(source) => {
        return Err(JsonFileError::Read {
          path: self.dir.display().to_string(),
          source,
        });
      }
    };

    let mut runs = Vec::new();
    for entry in entries.flatten() {
      let path = entry.path();
      if path.extension().is_some_and(|ext| ext == "json")
        && let Some(record) = read_json::<RunRecord>(&path)?
      {
        runs.push(record);
      }
    }
    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Ok(runs)
  }
}

const CLAIMS_DIR: &str = "active";
const CANCEL_DIR: &str = "cancel";
const REGISTRY_LOCK: &str = "registry.lock";
const REGISTRY_LOCK_POLL: Duration = Duration::from_millis(10);
const REGISTRY_LOCK_WAIT: Duration = Duration::from_secs(10);
/// A registry lock older than this was left behind by a dead process.
const REGISTRY_LOCK_STALE: Duration = Duration::from_secs(30);
const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum ClaimError {
  #[error("run {run_id} for {key} is waiting on approval; refusing to replace it")]
  InProgress { key: RunKey, run_id: String },

  #[error("run registry at {path} stayed locked for {waited:?}")]
  Contended { path: String, waited: Duration },

  #[error(transparent)]
  File(#[from] JsonFileError),
}

impl Classify for ClaimError {
  fn kind(&self) -> FailureKind {
    match self {
      ClaimError::InProgress { .. } => FailureKind::RunInProgress,
      ClaimError::Contended { .. } => FailureKind::LockTimeout,
      ClaimError::File(_) => FailureKind::Storage,
    }
  }
}

/// The run currently holding a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claim {
  key: RunKey,
  run_id: String,
  gated: bool,
  claimed_at: DateTime<Utc>,
}

/// A request to stop a run, picked up by whichever process executes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
  pub run_id: String,
  pub requested_by: String,
  pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockStamp {
  pid: u32,
  acquired_at: DateTime<Utc>,
}

struct RegistryGuard {
  path: PathBuf,
}

impl Drop for RegistryGuard {
  fn drop(&mut self) {
    if let Err(e) = fs::remove_file(&self.path)
      && e.kind() != io::ErrorKind::NotFound
    {
      warn!(path = %self.path.display(), error = %e, "failed to release run registry lock");
    }
  }
}

fn remove_if_present(path: &Path) -> Result<(), JsonFileError> {
  match fs::remove_file(path) {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(source) => Err(JsonFileError::Write {
      path: path.display().to_string(),
      source,
    }),
  }
}

/// In-flight runs keyed by (trigger, environment).
///
/// Claims and cancel requests live next to the run records, so every process
/// sharing a state root sees the same runs. A newer trigger cancels an older
/// ungated run on its key; a run waiting at the approval gate is never replaced.
/// Runs executing in this process also hold a local token so cancellation
/// reaches them without waiting for the next poll.
pub struct RunRegistry {
  store: RunStore,
  poll: Duration,
  local: Mutex<HashMap<String, CancellationToken>>,
}

impl RunRegistry {
  pub fn new(store: RunStore) -> Self {
    Self {
      store,
      poll: DEFAULT_CANCEL_POLL,
      local: Mutex::new(HashMap::new()),
    }
  }

  /// How often [`RunRegistry::watch`] looks for cancel requests.
  pub fn with_poll(mut self, poll: Duration) -> Self {
    self.poll = poll;
    self
  }

  fn claim_path(&self, key: &RunKey) -> PathBuf {
    self
      .store
      .dir
      .join(CLAIMS_DIR)
      .join(format!("{}.{}.json", key.trigger.as_str(), key.environment))
  }

  fn cancel_path(&self, run_id: &str) -> PathBuf {
    self.store.dir.join(CANCEL_DIR).join(format!("{}.json", run_id))
  }

  fn local(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    self.local.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  async fn lock(&self) -> Result<RegistryGuard, ClaimError> {
    let path = self.store.dir.join(REGISTRY_LOCK);
    let started = Instant::now();

    loop {
      let stamp = LockStamp {
        pid: std::process::id(),
        acquired_at: Utc::now(),
      };
      if create_json_exclusive(&path, &stamp)? {
        return Ok(RegistryGuard { path });
      }

      // A half-written stamp reads as a parse error; treat it as held.
      if let Ok(Some(held)) = read_json::<LockStamp>(&path)
        && (Utc::now() - held.acquired_at)
          .to_std()
          .is_ok_and(|age| age > REGISTRY_LOCK_STALE)
      {
        warn!(pid = held.pid, acquired_at = %held.acquired_at, "removing stale run registry lock");
        remove_if_present(&path)?;
        continue;
      }

      let waited = started.elapsed();
      if waited >= REGISTRY_LOCK_WAIT {
        return Err(ClaimError::Contended {
          path: path.display().to_string(),
          waited,
        });
      }
      tokio::time::sleep(REGISTRY_LOCK_POLL).await;
    }
  }

  /// A claimed run is live until its record is terminal or someone asked it to
  /// stop. A claim written just before its first record counts as live.
  fn is_live(&self, run_id: &str) -> Result<bool, ClaimError> {
    if self.cancel_requested(run_id) {
      return Ok(false);
    }
    Ok(self.store.load(run_id)?.is_none_or(|record| !record.state.is_terminal()))
  }

  fn request_cancel(&self, run_id: &str, requested_by: &str) -> Result<CancelRequest, ClaimError> {
    let request = CancelRequest {
      run_id: run_id.to_string(),
      requested_by: requested_by.to_string(),
      requested_at: Utc::now(),
    };
    write_json_atomic(&self.cancel_path(run_id), &request)?;
    if let Some(token) = self.local().get(run_id) {
      token.cancel();
    }
    Ok(request)
  }

  /// Claim `key` for a new run. An older ungated run on the same key is asked
  /// to stop; an older gated run makes this call fail instead.
  pub async fn register(&self, key: &RunKey, run_id: &str, gated: bool) -> Result<CancellationToken, ClaimError> {
    let _guard = self.lock().await?;
    let path = self.claim_path(key);

    if let Some(existing) = read_json::<Claim>(&path)?
      && existing.run_id != run_id
      && self.is_live(&existing.run_id)?
    {
      if existing.gated {
        debug!(key = %existing.key, run_id = %existing.run_id, since = %existing.claimed_at, "key held by gated run");
        return Err(ClaimError::InProgress {
          key: key.clone(),
          run_id: existing.run_id,
        });
      }
      info!(key = %key, cancelled = %existing.run_id, by = run_id, "cancelling superseded run");
      self.request_cancel(&existing.run_id, run_id)?;
    }

    let claim = Claim {
      key: key.clone(),
      run_id: run_id.to_string(),
      gated,
      claimed_at: Utc::now(),
    };
    write_json_atomic(&path, &claim)?;

    let token = CancellationToken::new();
    self.local().insert(run_id.to_string(), token.clone());
    Ok(token)
  }

  /// Release a finished run's claim, unless a newer run already took its key.
  pub async fn finish(&self, key: &RunKey, run_id: &str) -> Result<(), ClaimError> {
    self.local().remove(run_id);
    let _guard = self.lock().await?;

    let path = self.claim_path(key);
    if read_json::<Claim>(&path)?.is_some_and(|claim| claim.run_id == run_id) {
      remove_if_present(&path)?;
    }
    remove_if_present(&self.cancel_path(run_id))?;
    Ok(())
  }

  /// Ask a run to stop, wherever it executes. Returns `None` when the run is
  /// unknown or already finished.
  pub async fn cancel(&self, run_id: &str, requested_by: &str) -> Result<Option<CancelRequest>, ClaimError> {
    let _guard = self.lock().await?;
    match self.store.load(run_id)? {
      Some(record) if !record.state.is_terminal() => {
        info!(run_id, requested_by, "cancel requested");
        self.request_cancel(run_id, requested_by).map(Some)
      }
      _ => Ok(None),
    }
  }

  pub fn cancel_requested(&self, run_id: &str) -> bool {
    self.cancel_path(run_id).exists()
  }

  /// Cancel `token` once a cancel request for `run_id` appears. The task ends
  /// when the token is cancelled by anyone.
  pub fn watch(&self, run_id: &str, token: CancellationToken) -> JoinHandle<()> {
    let path = self.cancel_path(run_id);
    let poll = self.poll;
    let run_id = run_id.to_string();

    tokio::spawn(async move {
      loop {
        tokio::select! {
          _ = token.cancelled() => return,
          _ = tokio::time::sleep(poll) => {
            if path.exists() {
              debug!(run_id = %run_id, "cancel request found");
              token.cancel();
              return;
            }
          }
        }
      }
    })
  }
}
