//! Implementation of the `conveyor approve` and `conveyor reject` commands.

use anyhow::Result;

use conveyor_lib::approval::{ApprovalRequest, Decision};

use super::CmdContext;
use crate::output::{print_json, print_stat, print_success, print_warning};

pub fn cmd_approve(ctx: &CmdContext, plan_id: &str, approve: bool, comment: Option<String>) -> Result<()> {
  let services = ctx.services()?;
  let plan_id = services.plans.resolve_id(plan_id)?;
  let plan = services.plans.load(&plan_id)?;

  let decision = if approve { Decision::Approve } else { Decision::Reject };
  let approval = services.gate.record(ApprovalRequest {
    plan_id: plan.id.clone(),
    environment: plan.environment().to_string(),
    actor: ctx.actor.clone(),
    decision,
    comment,
  })?;

  if ctx.json() {
    print_json(&approval)?;
    return Ok(());
  }

  let message = format!("Plan {} for {} {}", approval.plan_id, approval.environment, past_tense(decision));
  match decision {
    Decision::Approve => print_success(&message),
    Decision::Reject => print_warning(&message),
  }
  print_stat("Digest", plan.digest().as_str());
  print_stat("By", &approval.actor);
  if let Some(comment) = &approval.comment {
    print_stat("Comment", comment);
  }
  Ok(())
}

fn past_tense(decision: Decision) -> &'static str {
  match decision {
    Decision::Approve => "approved",
    Decision::Reject => "rejected",
  }
}
