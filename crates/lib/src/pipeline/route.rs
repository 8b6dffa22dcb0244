//! Trigger -> route mapping.
//!
//! There is exactly one pipeline shape; a route only picks which part of it a
//! trigger runs and against which environments.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::trigger::{ManualAction, Trigger, TriggerEvent, TriggerKind};
use crate::config::TriggerConfig;
use crate::environment::Chain;
use crate::error::{Classify, FailureKind};

#[derive(Debug, Error)]
pub enum RouteError {
  #[error("no route is configured for {0} triggers")]
  NotConfigured(TriggerKind),

  #[error("unknown environment '{0}'")]
  UnknownEnvironment(String),

  #[error("route for {0} triggers has no environment left after skipping")]
  Empty(TriggerKind),
}

impl Classify for RouteError {
  fn kind(&self) -> FailureKind {
    FailureKind::Configuration
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "route", rename_all = "snake_case")]
pub enum Route {
  /// Build and plan only, for reviewers.
  Review { environment: String },
  /// Build, then plan and apply each environment in order, promoting between them.
  Deploy { environments: Vec<String> },
  /// Resolve a release tag and promote that digest into `target`.
  Release {
    source: String,
    target: String,
    require_chain: bool,
  },
  Manual { environment: String, action: ManualAction },
}

/// Identifies runs that compete for the same environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RunKey {
  pub trigger: TriggerKind,
  pub environment: String,
}

impl fmt::Display for RunKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}/{}", self.trigger, self.environment)
  }
}

impl Route {
  pub fn for_trigger(event: &TriggerEvent, triggers: &TriggerConfig, chain: &Chain) -> Result<Self, RouteError> {
    let known = |name: &str| -> Result<(), RouteError> {
      chain
        .get(name)
        .map(|_| ())
        .ok_or_else(|| RouteError::UnknownEnvironment(name.to_string()))
    };

    let route = match &event.trigger {
      Trigger::ChangeProposal { .. } => {
        let review = triggers
          .change_proposal
          .as_ref()
          .ok_or(RouteError::NotConfigured(TriggerKind::ChangeProposal))?;
        Route::Review {
          environment: review.environment.clone(),
        }
      }
      Trigger::Merge { .. } => {
        let deploy = triggers
          .merge
          .as_ref()
          .ok_or(RouteError::NotConfigured(TriggerKind::Merge))?;
        for name in &deploy.environments {
          known(name)?;
        }
        let environments: Vec<String> = deploy
          .environments
          .iter()
          .filter(|name| chain.get(name).is_some_and(|env| !env.skip))
          .cloned()
          .collect();
        if environments.is_empty() {
          return Err(RouteError::Empty(TriggerKind::Merge));
        }
        Route::Deploy { environments }
      }
      Trigger::ReleaseTag { .. } => {
        let release = triggers
          .release_tag
          .as_ref()
          .ok_or(RouteError::NotConfigured(TriggerKind::ReleaseTag))?;
        Route::Release {
          source: release.source.clone(),
          target: release.target.clone(),
          require_chain: release.require_chain,
        }
      }
      Trigger::Manual { environment, action } => Route::Manual {
        environment: environment.clone(),
        action: action.clone(),
      },
    };

    for name in route.environments() {
      known(name)?;
    }
    Ok(route)
  }

  /// Environments this route writes to, in order.
  pub fn environments(&self) -> Vec<&str> {
    match self {
      Route::Review { environment } | Route::Manual { environment, .. } => vec![environment.as_str()],
      Route::Deploy { environments } => environments.iter().map(String::as_str).collect(),
      Route::Release { target, .. } => vec![target.as_str()],
    }
  }

  /// The environment the route ends at.
  pub fn final_environment(&self) -> &str {
    self.environments().last().copied().unwrap_or_default()
  }

  pub fn key(&self, trigger: TriggerKind) -> RunKey {
    RunKey {
      trigger,
      environment: self.final_environment().to_string(),
    }
  }

  /// Whether the route waits on a human somewhere. Such runs are never
  /// cancelled by a newer trigger.
  pub fn is_gated(&self, chain: &Chain) -> bool {
    match self {
      Route::Review { .. } | Route::Manual { action: ManualAction::Plan { .. }, .. } => false,
      _ => self
        .environments()
        .iter()
        .any(|name| chain.get(name).is_some_and(|env| env.requires_approval)),
    }
  }
}

impl fmt::Display for Route {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Route::Review { environment } => write!(f, "review({})", environment),
      Route::Deploy { environments } => write!(f, "deploy({})", environments.join(" -> ")),
      Route::Release { source, target, .. } => write!(f, "release({} -> {})", source, target),
      Route::Manual { environment, action } => match action {
        ManualAction::Plan { .. } => write!(f, "manual-plan({})", environment),
        ManualAction::Apply { .. } => write!(f, "manual-apply({})", environment),
      },
    }
  }
}
