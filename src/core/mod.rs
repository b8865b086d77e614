//! Core module - shared infrastructure for Quill
//!
//! This module contains foundational types, the message protocol,
//! configuration, and error handling used throughout the crate.

pub mod config;
pub mod error;
pub mod message;
pub mod types;

pub use config::Config;
pub use error::{QuillError, Result};
pub use message::{Component, Message, MessageKind, Payload};
pub use types::*;
