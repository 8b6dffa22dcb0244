//! Implementation of the `conveyor cancel` command.
//!
//! Leaves a cancel request next to the run records. The process executing the
//! run picks it up at its next stage boundary, or while waiting for approval.

use anyhow::{Result, bail};

use conveyor_lib::pipeline::{RunRegistry, RunStore};

use super::CmdContext;
use crate::output::{print_info, print_json, print_stat, print_success};

pub fn cmd_cancel(ctx: &CmdContext, run_id: &str) -> Result<()> {
  let store = RunStore::new(ctx.paths().runs());
  let matches: Vec<String> = store
    .list()?
    .into_iter()
    .map(|run| run.run_id)
    .filter(|id| id.starts_with(run_id))
    .collect();
  let run_id = match matches.as_slice() {
    [id] => id.clone(),
    [] => bail!("No run matches '{}'", run_id),
    _ => bail!("Run id '{}' is ambiguous ({} matches)", run_id, matches.len()),
  };

  let registry = RunRegistry::new(store);
  let rt = ctx.runtime()?;
  let Some(request) = rt.block_on(registry.cancel(&run_id, &ctx.actor))? else {
    print_info(&format!("Run {} already finished.", run_id));
    return Ok(());
  };

  if ctx.json() {
    print_json(&request)?;
  } else {
    print_success(&format!("Cancel requested for run {}", request.run_id));
    print_stat("Requested by", &request.requested_by);
  }
  Ok(())
}
