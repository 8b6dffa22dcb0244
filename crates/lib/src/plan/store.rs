//! Plan storage.
//!
//! # Storage Layout
//!
//! ```text
//! {root}/plans/
//! ├── <id>.json            # Plan (write-once)
//! ├── <id>.status.json     # PlanStatusRecord
//! └── pending/<env>.json   # The environment's single pending plan id
//! ```
//!
//! Pending-index updates happen under the environment lock, which is what
//! keeps "at most one pending plan per environment" true across processes.

use std::fs;
use std::io;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::types::{Plan, PlanId, PlanStatus, PlanStatusRecord};
use crate::error::{Classify, FailureKind};
use crate::util::fs::{JsonFileError, create_json_exclusive, read_json, write_json_atomic};

const PENDING_DIR: &str = "pending";

#[derive(Debug, Error)]
pub enum PlanStoreError {
  #[error("plan {0} not found")]
  NotFound(PlanId),

  #[error("plan prefix '{prefix}' is ambiguous ({count} matches)")]
  Ambiguous { prefix: String, count: usize },

  #[error("plan {0} already exists and plans are never overwritten")]
  AlreadyExists(PlanId),

  #[error("plan {id} is {from}, cannot become {to}")]
  InvalidTransition { id: PlanId, from: PlanStatus, to: PlanStatus },

  #[error(transparent)]
  File(#[from] JsonFileError),

  #[error("failed to list plans: {0}")]
  List(#[source] io::Error),
}

impl Classify for PlanStoreError {
  fn kind(&self) -> FailureKind {
    match self {
      PlanStoreError::NotFound(_) => FailureKind::NotFound,
      PlanStoreError::Ambiguous { .. } | PlanStoreError::InvalidTransition { .. } => FailureKind::Configuration,
      PlanStoreError::AlreadyExists(_) | PlanStoreError::File(_) | PlanStoreError::List(_) => FailureKind::Storage,
    }
  }
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingPointer {
  plan_id: PlanId,
}

#[derive(Debug, Clone)]
pub struct PlanStore {
  base_path: PathBuf,
}

impl PlanStore {
  pub fn new(base_path: impl Into<PathBuf>) -> Self {
    Self {
      base_path: base_path.into(),
    }
  }

  fn plan_path(&self, id: &PlanId) -> PathBuf {
    self.base_path.join(format!("{}.json", id))
  }

  fn status_path(&self, id: &PlanId) -> PathBuf {
    self.base_path.join(format!("{}.status.json", id))
  }

  fn pending_path(&self, environment: &str) -> PathBuf {
    self.base_path.join(PENDING_DIR).join(format!("{}.json", environment))
  }

  /// Persist a new plan. Fails if a plan with the same id exists.
  pub fn save(&self, plan: &Plan) -> Result<(), PlanStoreError> {
    if !create_json_exclusive(&self.plan_path(&plan.id), plan)? {
      return Err(PlanStoreError::AlreadyExists(plan.id.clone()));
    }
    debug!(plan_id = %plan.id, environment = plan.environment(), "saved plan");
    Ok(())
  }

  pub fn load(&self, id: &PlanId) -> Result<Plan, PlanStoreError> {
    read_json(&self.plan_path(id))?.ok_or_else(|| PlanStoreError::NotFound(id.clone()))
  }

  pub fn status(&self, id: &PlanId) -> Result<PlanStatusRecord, PlanStoreError> {
    read_json(&self.status_path(id))?.ok_or_else(|| PlanStoreError::NotFound(id.clone()))
  }

  /// Make `plan` the environment's pending plan, superseding the previous one.
  ///
  /// Returns the id of the superseded plan, if any.
  pub fn mark_pending(&self, plan: &Plan) -> Result<Option<PlanId>, PlanStoreError> {
    let previous = self.pending(plan.environment())?;
    if let Some(previous_id) = &previous
      && previous_id != &plan.id
    {
      self.set_status(previous_id, PlanStatus::Superseded, Some(format!("superseded by {}", plan.id)))?;
      info!(environment = plan.environment(), superseded = %previous_id, by = %plan.id, "plan superseded");
    }

    write_json_atomic(
      &self.status_path(&plan.id),
      &PlanStatusRecord {
        status: PlanStatus::Pending,
        updated_at: Utc::now(),
        reason: None,
      },
    )?;
    write_json_atomic(
      &self.pending_path(plan.environment()),
      &PendingPointer {
        plan_id: plan.id.clone(),
      },
    )?;

    Ok(previous.filter(|id| id != &plan.id))
  }

  /// The environment's current pending plan id.
  pub fn pending(&self, environment: &str) -> Result<Option<PlanId>, PlanStoreError> {
    let pointer: Option<PendingPointer> = read_json(&self.pending_path(environment))?;
    Ok(pointer.map(|p| p.plan_id))
  }

  /// Move a pending plan to a terminal status.
  pub fn set_status(&self, id: &PlanId, status: PlanStatus, reason: Option<String>) -> Result<(), PlanStoreError> {
    let current = self.status(id)?;
    if !current.status.can_transition_to(status) {
      return Err(PlanStoreError::InvalidTransition {
        id: id.clone(),
        from: current.status,
        to: status,
      });
    }

    write_json_atomic(
      &self.status_path(id),
      &PlanStatusRecord {
        status,
        updated_at: Utc::now(),
        reason,
      },
    )?;

    let plan = self.load(id)?;
    if self.pending(plan.environment())?.as_ref() == Some(id) {
      let path = self.pending_path(plan.environment());
      match fs::remove_file(&path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => {
          return Err(
            JsonFileError::Write {
              path: path.display().to_string(),
              source,
            }
            .into(),
          );
        }
      }
    }

    debug!(plan_id = %id, status = %status, "plan status updated");
    Ok(())
  }

  /// Resolve a full id or a unique prefix of one.
  pub fn resolve_id(&self, prefix: &str) -> Result<PlanId, PlanStoreError> {
    let exact = PlanId::from(prefix);
    if self.plan_path(&exact).exists() {
      return Ok(exact);
    }

    let matches: Vec<PlanId> = self.ids()?.into_iter().filter(|id| id.as_str().starts_with(prefix)).collect();
    match matches.len() {
      0 => Err(PlanStoreError::NotFound(exact)),
      1 => Ok(matches.into_iter().next().unwrap_or(exact)),
      count => Err(PlanStoreError::Ambiguous {
        prefix: prefix.to_string(),
        count,
      }),
    }
  }

  fn ids(&self) -> Result<Vec<PlanId>, PlanStoreError> {
    let entries = match fs::read_dir(&self.base_path) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(PlanStoreError::List(e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry.map_err(PlanStoreError::List)?;
      let name = entry.file_name();
      let name = name.to_string_lossy();
      if let Some(id) = name.strip_suffix(".json")
        && !id.ends_with(".status")
        && !id.ends_with(".tmp")
      {
        ids.push(PlanId::from(id));
      }
    }
    Ok(ids)
  }

  /// Every stored plan with its status, newest first, optionally for one environment.
  pub fn list(&self, environment: Option<&str>) -> Result<Vec<(Plan, PlanStatus)>, PlanStoreError> {
    let mut plans = Vec::new();
    for id in self.ids()? {
      let plan = self.load(&id)?;
      if environment.is_some_and(|env| env != plan.environment()) {
        continue;
      }
      let status = self.status(&id).map(|s| s.status).unwrap_or(PlanStatus::Pending);
      plans.push((plan, status));
    }
    plans.sort_by(|a, b| b.0.body.created_at.cmp(&a.0.body.created_at));
    Ok(plans)
  }
}
