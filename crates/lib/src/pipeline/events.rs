//! Run event sinks.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::state::RunState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunEvent {
  pub run_id: String,
  pub at: DateTime<Utc>,
  pub state: RunState,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub detail: Option<String>,
}

/// Receives every run state transition.
pub trait EventSink: Send + Sync {
  fn emit(&self, event: &RunEvent);
}

/// Logs transitions as structured tracing events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
  fn emit(&self, event: &RunEvent) {
    let detail = event.detail.as_deref().unwrap_or("");
    match event.state {
      RunState::Failed | RunState::Cancelled => {
        warn!(run_id = %event.run_id, state = %event.state, detail, "run transition")
      }
      _ => info!(run_id = %event.run_id, state = %event.state, detail, "run transition"),
    }
  }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
  events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn events(&self) -> Vec<RunEvent> {
    self.events.lock().map(|e| e.clone()).unwrap_or_default()
  }

  pub fn states(&self, run_id: &str) -> Vec<RunState> {
    self
      .events()
      .into_iter()
      .filter(|e| e.run_id == run_id)
      .map(|e| e.state)
      .collect()
  }
}

impl EventSink for RecordingSink {
  fn emit(&self, event: &RunEvent) {
    if let Ok(mut events) = self.events.lock() {
      events.push(event.clone());
    }
  }
}

/// Forwards to several sinks.
pub struct FanOut(pub Vec<std::sync::Arc<dyn EventSink>>);

impl EventSink for FanOut {
  fn emit(&self, event: &RunEvent) {
    for sink in &self.0 {
      sink.emit(event);
    }
  }
}
