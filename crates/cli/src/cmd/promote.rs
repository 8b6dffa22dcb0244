//! Implementation of the `conveyor promote` command.

use anyhow::{Context, Result};
use tracing::warn;

use conveyor_lib::artifact::{Digest, TagContext};

use super::CmdContext;
use crate::output::{print_json, print_stat, print_success};

/// Copy `digest` from the source environment's registry into the target's,
/// tagging it with the target's templates.
///
/// Every environment before the target must already run the digest unless
/// `skip_chain_check` is set.
pub fn cmd_promote(ctx: &CmdContext, source: &str, target: &str, digest: &str, skip_chain_check: bool) -> Result<()> {
  let digest = Digest::parse(digest).context("Invalid --digest")?;
  let services = ctx.services()?;
  let source_env = services.environment(source)?;
  let target_env = services.environment(target)?;

  if skip_chain_check {
    warn!(target, digest = %digest, "promoting without checking the chain");
  } else {
    services.check_chain(target, &digest)?;
  }

  let tags = target_env
    .render_tags(&TagContext::new(&target_env.name))
    .with_context(|| format!("Failed to render tags for {}", target_env.name))?;
  let source_registry = services.registry(source)?;
  let target_registry = services.registry(target)?;

  let rt = ctx.runtime()?;
  let promotion = rt.block_on(services.promoter.promote(
    source_env,
    source_registry.as_ref(),
    target_env,
    target_registry.as_ref(),
    &digest,
    &tags,
  ))?;

  if ctx.json() {
    print_json(&promotion)?;
  } else {
    print_success(&format!("Promoted {} from {} to {}", promotion.digest.short(), source, target));
    print_stat("Digest", promotion.digest.as_str());
    if !promotion.tags.is_empty() {
      let tags: Vec<&str> = promotion.tags.iter().map(String::as_str).collect();
      print_stat("Tags", &tags.join(", "));
    }
  }
  Ok(())
}
