//! Orchestration module - command routing and the control loop
//!
//! The dispatcher maps command names to agents; the engine drives a
//! top-level task through planning, subtask execution with review-gated
//! improvement, and integration.

pub mod builder;
pub mod dispatcher;
pub mod engine;
pub mod state;

pub use builder::EngineBuilder;
pub use dispatcher::{CommandDispatcher, DispatchResult, DispatchStatus};
pub use engine::{Engine, RunRequest};
pub use state::{ProcessState, RunState};
