//! Implementation of the `conveyor resolve` command.

use anyhow::Result;

use conveyor_lib::resolve::resolve;

use super::CmdContext;
use crate::output::{print_json, print_stat};

pub fn cmd_resolve(ctx: &CmdContext, environment: &str, tag: &str) -> Result<()> {
  let services = ctx.services()?;
  services.environment(environment)?;
  let registry = services.registry(environment)?;

  let rt = ctx.runtime()?;
  let resolved = rt.block_on(resolve(registry.as_ref(), tag, &services.config.retry))?;

  if ctx.json() {
    print_json(&resolved)?;
  } else {
    println!("{}", resolved.digest);
    let tags: Vec<&str> = resolved.tags.iter().map(String::as_str).collect();
    print_stat("Tags", &tags.join(", "));
  }
  Ok(())
}
