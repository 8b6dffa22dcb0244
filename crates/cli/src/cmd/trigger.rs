//! Implementation of the `conveyor trigger` command.
//!
//! Feeds one trigger event through the orchestrator and reports the run.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Subcommand;

use conveyor_lib::artifact::{Digest, SourceRef};
use conveyor_lib::pipeline::{ManualAction, Orchestrator, RunRecord, TracingSink, Trigger, TriggerEvent};

use super::CmdContext;
use crate::output::{print_json, print_stat, print_success};

#[derive(Subcommand)]
pub enum TriggerCommand {
  /// A change proposal was opened or updated: build and plan for review
  ChangeProposal {
    #[arg(long)]
    revision: String,

    #[arg(long)]
    path: Option<PathBuf>,
  },

  /// A change was merged: build once and deploy along the merge route
  Merge {
    #[arg(long)]
    revision: String,

    #[arg(long)]
    path: Option<PathBuf>,
  },

  /// A release tag was pushed: promote the tagged digest to the release target
  ReleaseTag { tag: String },

  /// Plan a digest for one environment as a tracked run
  Plan {
    environment: String,

    #[arg(long)]
    digest: String,

    #[arg(long = "from")]
    promoted_from: Option<String>,
  },

  /// Apply a stored plan as a tracked run, waiting for approval if needed
  Apply {
    environment: String,

    #[arg(long = "plan")]
    plan_id: String,
  },
}

fn source_ref(revision: String, path: Option<PathBuf>) -> SourceRef {
  let source = SourceRef::new(revision);
  match path {
    Some(path) => source.with_path(path),
    None => source,
  }
}

pub fn cmd_trigger(ctx: &CmdContext, command: TriggerCommand) -> Result<()> {
  let services = Arc::new(ctx.services()?);

  let trigger = match command {
    TriggerCommand::ChangeProposal { revision, path } => Trigger::ChangeProposal {
      source: source_ref(revision, path),
    },
    TriggerCommand::Merge { revision, path } => Trigger::Merge {
      source: source_ref(revision, path),
    },
    TriggerCommand::ReleaseTag { tag } => Trigger::ReleaseTag { tag },
    TriggerCommand::Plan {
      environment,
      digest,
      promoted_from,
    } => Trigger::Manual {
      environment,
      action: ManualAction::Plan {
        digest: Digest::parse(&digest).context("Invalid --digest")?,
        promoted_from,
      },
    },
    TriggerCommand::Apply { environment, plan_id } => Trigger::Manual {
      action: ManualAction::Apply {
        plan_id: services.plans.resolve_id(&plan_id)?,
      },
      environment,
    },
  };

  let orchestrator = Orchestrator::new(services, Arc::new(TracingSink));
  let rt = ctx.runtime()?;
  let record = rt.block_on(orchestrator.handle(TriggerEvent::new(trigger, ctx.actor.clone())))?;

  if ctx.json() {
    print_json(&record)?;
  } else {
    print_run(&record);
  }
  Ok(())
}

fn print_run(record: &RunRecord) {
  print_success(&format!("Run {} {}", record.run_id, record.state));
  print_stat("Route", &record.route.to_string());
  if let Some(digest) = &record.digest {
    print_stat("Digest", digest.as_str());
  }
  for plan in &record.plans {
    print_stat(&format!("Plan ({})", plan.environment), plan.plan_id.as_str());
  }
}
