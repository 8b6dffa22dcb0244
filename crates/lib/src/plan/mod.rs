//! Plans: computation, write-once storage and lifecycle.

mod planner;
mod store;
mod types;

pub use planner::{PlanError, PlanRequest, Planner, PlannerState};
pub use store::{PlanStore, PlanStoreError};
pub use types::{Plan, PlanBody, PlanId, PlanStatus, PlanStatusRecord};
