//! Implementation of the `conveyor status` command.
//!
//! Shows, per environment, the digest last applied, the lock holder if any and
//! the pending plan awaiting apply.

use anyhow::Result;
use serde::Serialize;

use conveyor_lib::artifact::Digest;
use conveyor_lib::lock::Lease;
use conveyor_lib::plan::PlanId;

use super::CmdContext;
use crate::output::{print_json, print_stat, symbols};

#[derive(Serialize)]
struct EnvironmentStatus {
  environment: String,
  requires_approval: bool,
  skip: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  deployed: Option<Digest>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pending_plan: Option<PlanId>,
  #[serde(skip_serializing_if = "Option::is_none")]
  lock: Option<Lease>,
}

pub fn cmd_status(ctx: &CmdContext, environment: Option<&str>) -> Result<()> {
  let services = ctx.services()?;
  let envs = match environment {
    Some(name) => vec![services.environment(name)?],
    None => services.chain.iter().collect(),
  };

  let rt = ctx.runtime()?;
  let mut statuses = Vec::with_capacity(envs.len());
  for env in envs {
    let deployed = services
      .records
      .current(&env.name)?
      .and_then(|record| record.applied_digest().cloned());
    statuses.push(EnvironmentStatus {
      environment: env.name.clone(),
      requires_approval: env.requires_approval,
      skip: env.skip,
      deployed,
      pending_plan: services.plans.pending(&env.name)?,
      lock: rt.block_on(services.locks.current(&env.name))?,
    });
  }

  if ctx.json() {
    return print_json(&statuses);
  }

  for (i, status) in statuses.iter().enumerate() {
    if i > 0 {
      println!();
    }
    let mut heading = status.environment.clone();
    if status.requires_approval {
      heading.push_str(" (approval required)");
    }
    if status.skip {
      heading.push_str(" (skipped)");
    }
    println!("{} {}", symbols::INFO, heading);
    print_stat(
      "Deployed",
      status.deployed.as_ref().map_or("nothing yet", |d| d.as_str()),
    );
    if let Some(plan_id) = &status.pending_plan {
      print_stat("Pending plan", plan_id.as_str());
    }
    if let Some(lease) = &status.lock {
      print_stat(
        "Locked",
        &format!("{} by {} until {}", lease.lock_id, lease.holder, lease.expires_at),
      );
    }
  }
  Ok(())
}
