//! Implementation of the `conveyor history` command.

use anyhow::Result;

use conveyor_lib::record::{PromotionRecord, RecordEvent};

use super::CmdContext;
use crate::output::{print_info, print_json};

pub fn cmd_history(ctx: &CmdContext, environment: &str, limit: Option<usize>) -> Result<()> {
  let services = ctx.services()?;
  services.environment(environment)?;

  let mut history = services.records.history(environment)?;
  if let Some(limit) = limit {
    let skip = history.len().saturating_sub(limit);
    history.drain(..skip);
  }

  if ctx.json() {
    return print_json(&history);
  }

  if history.is_empty() {
    print_info(&format!("No promotion records for {}.", environment));
    return Ok(());
  }
  for record in &history {
    println!("{}", describe(record));
  }
  Ok(())
}

fn describe(record: &PromotionRecord) -> String {
  let when = record.recorded_at.format("%Y-%m-%d %H:%M:%S");
  match &record.event {
    RecordEvent::Applied { source, digest, plan_id } => format!(
      "#{:<4} {}  applied {} (plan {}, from {}) by {}",
      record.sequence,
      when,
      digest,
      plan_id,
      source.as_deref().unwrap_or("build"),
      record.actor
    ),
    RecordEvent::ForcedUnlock { lock_id, holder } => format!(
      "#{:<4} {}  force-unlocked {} held by {} by {}",
      record.sequence, when, lock_id, holder, record.actor
    ),
  }
}
