//! Implementation of the `conveyor force-unlock` command.
//!
//! The lock id must match the lease currently held, so an operator can only
//! release the lock they inspected. Every forced release is appended to the
//! environment's promotion record.

use anyhow::{Result, bail};

use conveyor_lib::lock::LockId;

use super::CmdContext;
use crate::output::{print_info, print_json, print_stat, print_success};
use crate::prompts::confirm;

pub fn cmd_force_unlock(ctx: &CmdContext, environment: &str, lock_id: &str, force: bool) -> Result<()> {
  let services = ctx.services()?;
  services.environment(environment)?;
  let lock_id = LockId::from(lock_id);

  let rt = ctx.runtime()?;
  let Some(current) = rt.block_on(services.locks.current(environment))? else {
    print_info(&format!("{} is not locked.", environment));
    return Ok(());
  };

  if !confirm(
    &format!(
      "Release lock {} on {} held by {} since {}?",
      current.lock_id, environment, current.holder, current.acquired_at
    ),
    force,
  )? {
    bail!("Aborted");
  }

  let (lease, record) = rt.block_on(services.force_unlock(environment, &lock_id, &ctx.actor))?;

  if ctx.json() {
    print_json(&lease)?;
  } else {
    print_success(&format!("Released lock {} on {}", lease.lock_id, environment));
    print_stat("Holder", &lease.holder);
    print_stat("Record", &format!("#{}", record.sequence));
  }
  Ok(())
}
