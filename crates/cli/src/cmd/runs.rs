//! Implementation of the `conveyor runs` command.

use anyhow::Result;

use conveyor_lib::pipeline::RunStore;

use super::CmdContext;
use crate::output::{print_info, print_json, truncate_hash};

pub fn cmd_runs(ctx: &CmdContext, limit: usize) -> Result<()> {
  let store = RunStore::new(ctx.paths().runs());
  let runs: Vec<_> = store.list()?.into_iter().take(limit).collect();

  if ctx.json() {
    return print_json(&runs);
  }

  if runs.is_empty() {
    print_info("No runs recorded.");
    return Ok(());
  }
  for run in &runs {
    let digest = run.digest.as_ref().map_or("-", |d| d.short());
    println!(
      "{}  {}  {:<16} {:<20} {}  {}",
      truncate_hash(&run.run_id),
      run.started_at.format("%Y-%m-%d %H:%M:%S"),
      run.trigger.as_str(),
      run.state.to_string(),
      digest,
      run.route
    );
    if let Some(failure) = &run.failure {
      println!("    {} at {}: {}", failure.kind.as_str(), failure.stage, failure.message);
    }
  }
  Ok(())
}
