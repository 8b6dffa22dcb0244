//! Implementation of the `conveyor plan` command.
//!
//! Computes the change set that would move one environment to a digest and
//! stores it as the environment's pending plan.

use anyhow::{Context, Result};

use conveyor_lib::artifact::Digest;
use conveyor_lib::engine::ChangeAction;
use conveyor_lib::plan::{Plan, PlanRequest};

use super::CmdContext;
use crate::output::{print_info, print_json, print_stat, print_success, symbols, truncate_hash};

pub fn cmd_plan(ctx: &CmdContext, environment: &str, digest: &str, promoted_from: Option<&str>) -> Result<()> {
  let digest = Digest::parse(digest).context("Invalid --digest")?;
  let services = ctx.services()?;
  let env = services.environment(environment)?;

  let mut request = PlanRequest::new(digest, ctx.actor.clone());
  if let Some(source) = promoted_from {
    services.environment(source)?;
    request = request.promoted_from(source);
  }

  let rt = ctx.runtime()?;
  let plan = rt.block_on(services.planner.plan(env, &request))?;

  if ctx.json() {
    print_json(&plan)?;
  } else {
    print_plan(&plan);
  }
  Ok(())
}

fn print_plan(plan: &Plan) {
  print_success(&format!("Plan {} for {}", plan.id, plan.environment()));
  print_stat("Digest", plan.digest().as_str());
  print_stat("Fingerprint", truncate_hash(plan.fingerprint().as_str()));
  if let Some(source) = &plan.body.promoted_from {
    print_stat("Promoted from", source);
  }
  if plan.body.requires_approval {
    print_stat("Approval", "required");
  }

  if plan.is_noop() {
    print_info("No changes; infrastructure already matches.");
    return;
  }

  println!();
  for change in &plan.body.changes {
    let symbol = match change.action {
      ChangeAction::Create => symbols::ADD,
      ChangeAction::Update => symbols::MODIFY,
      ChangeAction::Delete => symbols::REMOVE,
    };
    match (&change.before, &change.after) {
      (Some(before), Some(after)) => println!("  {} {}: {} {} {}", symbol, change.address, before, symbols::ARROW, after),
      (None, Some(after)) => println!("  {} {}: {}", symbol, change.address, after),
      (Some(before), None) => println!("  {} {}: {}", symbol, change.address, before),
      (None, None) => println!("  {} {}", symbol, change.address),
    }
  }
}
