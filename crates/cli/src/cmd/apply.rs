//! Implementation of the `conveyor apply` command.

use anyhow::Result;

use conveyor_lib::apply::ApplyOutcome;

use super::CmdContext;
use crate::output::{print_json, print_stat, print_success};

/// Apply a stored plan by id or unique id prefix.
///
/// Without `--wait`, a plan that still needs approval fails immediately with
/// the approval exit code instead of blocking.
pub fn cmd_apply(ctx: &CmdContext, environment: &str, plan_id: &str, wait: bool) -> Result<()> {
  let services = ctx.services()?;
  let env = services.environment(environment)?;
  let plan_id = services.plans.resolve_id(plan_id)?;

  let mut apply_ctx = services.apply_context(&ctx.actor);
  apply_ctx.wait_for_approval = wait;

  let rt = ctx.runtime()?;
  let outcome = rt.block_on(services.applier.apply(env, &plan_id, &apply_ctx))?;

  if ctx.json() {
    print_json(&outcome)?;
  } else {
    print_outcome(&outcome);
  }
  Ok(())
}

fn print_outcome(outcome: &ApplyOutcome) {
  print_success(&format!(
    "Applied {} to {}",
    outcome.plan.digest().short(),
    outcome.plan.environment()
  ));
  print_stat("Plan", outcome.plan.id.as_str());
  print_stat("Changes", &outcome.report.applied.len().to_string());
  print_stat("Fingerprint", outcome.report.fingerprint.as_str());
  print_stat("Record", &format!("#{}", outcome.record.sequence));
}
