//! conveyor-lib: build-once, promote-by-digest deployment pipeline
//!
//! The pieces, roughly in the order a run uses them:
//! - `build`: turns a source revision into one artifact digest, exactly once
//! - `promote` / `resolve`: move and look up artifacts by digest across registries
//! - `plan` / `apply`: compute and execute change sets under environment locks
//! - `approval`: the human gate in front of protected environments
//! - `pipeline`: routes triggers to runs and drives them to a terminal state

pub mod apply;
pub mod approval;
pub mod artifact;
pub mod build;
pub mod config;
pub mod consts;
pub mod engine;
pub mod environment;
pub mod error;
pub mod lock;
pub mod paths;
pub mod pipeline;
pub mod plan;
pub mod promote;
pub mod record;
pub mod registry;
pub mod resolve;
pub mod retry;
pub mod services;
pub mod util;
