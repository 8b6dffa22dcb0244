//! Implementation of the `conveyor build` command.
//!
//! Builds a revision once and pushes it to an environment registry. Building
//! an already-recorded revision reuses the recorded digest.

use std::path::PathBuf;

use anyhow::{Context, Result};

use conveyor_lib::artifact::{SourceRef, TagContext};

use super::CmdContext;
use crate::output::{print_info, print_json, print_stat, print_success};

pub fn cmd_build(ctx: &CmdContext, revision: &str, path: Option<PathBuf>, environment: Option<&str>) -> Result<()> {
  let services = ctx.services()?;
  let env = match environment {
    Some(name) => services.environment(name)?,
    None => services.chain.first().context("No environments configured")?,
  };

  let mut source = SourceRef::new(revision);
  if let Some(path) = path {
    source = source.with_path(path);
  }
  let tags = env
    .render_tags(&TagContext::new(&env.name).source(&source))
    .with_context(|| format!("Failed to render tags for {}", env.name))?;
  let registry = services.registry(&env.name)?;

  let rt = ctx.runtime()?;
  let output = rt.block_on(services.builder.build(&source, registry.as_ref(), &tags))?;

  if ctx.json() {
    print_json(&output)?;
  } else {
    print_success(&format!("Built {} into {}", output.revision, env.name));
    print_stat("Digest", output.digest.as_str());
    if !output.tags.is_empty() {
      let tags: Vec<&str> = output.tags.iter().map(String::as_str).collect();
      print_stat("Tags", &tags.join(", "));
    }
    if output.reused {
      print_info("Revision was already built; reused the recorded digest.");
    }
  }
  Ok(())
}
