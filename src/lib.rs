//! Quill - Multi-Agent Long-Form Writing
//!
//! A Rust orchestration engine that coordinates a Director, Planner, Worker
//! and Reviewer over a local Ollama model to produce long texts from a short
//! theme.
//!
//! # Architecture
//!
//! - **Core**: Shared types, the message protocol, configuration, and error handling
//! - **LLM**: Backend abstraction with Ollama implementation, templates, retry gateway
//! - **Session**: Per-run state, bounded active cache, durable snapshots
//! - **Agent**: The four agent roles behind one `process(Message)` operation
//! - **Orchestration**: Command dispatcher and the plan/execute/review/integrate loop
//!
//! # Usage
//!
//! ```rust,no_run
//! use quill::core::{Config, Task};
//! use quill::orchestration::{Engine, RunRequest};
//!
//! #[tokio::main]
//! async fn main() -> quill::Result<()> {
//!     let engine = Engine::from_config(Config::load())?;
//!
//!     let task = Task::new("T1", "A dragon tale", "A short story for children")
//!         .with_requirements(["include a dragon"]);
//!     let result = engine.run(RunRequest::new(task)).await;
//!
//!     println!("{}: {}", result.status, result.content.unwrap_or_default());
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod core;
pub mod llm;
pub mod orchestration;
pub mod session;

// Re-export commonly used items
pub use core::{Config, FinalResult, QuillError, Result, RunStatus, Task};
pub use orchestration::{Engine, EngineBuilder, RunRequest};
