//! Session module - per-run state and its storage
//!
//! A session threads context across the many model calls of one run: the
//! task tree, intermediate results and the full message history.

pub mod backend;
pub mod state;
pub mod store;

pub use backend::{FileBackend, SessionBackend};
pub use state::Session;
pub use store::{SessionHandle, SessionStore, DEFAULT_OWNER};
