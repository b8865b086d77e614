//! Custom error types for Quill
//!
//! Provides a unified error handling system across all modules.

use thiserror::Error;

/// Main error type for Quill operations
#[derive(Error, Debug)]
pub enum QuillError {
    /// Requested prompt template is not registered
    #[error("Template '{template_id}' not found. Available: {}", available.join(", "))]
    TemplateNotFound {
        template_id: String,
        available: Vec<String>,
    },

    /// Template placeholders without a value
    #[error("Missing template variables: {}", .0.join(", "))]
    MissingVariable(Vec<String>),

    /// Planner output could not be turned into a valid plan
    #[error("Plan parse error: {0}")]
    PlanParse(String),

    /// Durable session storage failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Session id already held by a different owner
    #[error("Session '{session_id}' belongs to another owner than '{owner}'")]
    SessionOwner { session_id: String, owner: String },

    /// Text generation still failing after all retries
    #[error("Model generation failed after {attempts} attempt(s): {message}")]
    ModelGeneration { attempts: u32, message: String },

    /// Dispatcher received a command name it does not know
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// A subtask was about to run before its dependencies completed
    #[error("Task '{task_id}' has unsatisfied dependencies: {}", missing.join(", "))]
    DependencyUnsatisfied {
        task_id: String,
        missing: Vec<String>,
    },

    /// Malformed inter-agent message
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Ollama connection or API errors
    #[error("Ollama error: {0}")]
    Ollama(String),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request errors
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error for other cases
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type for Quill operations
pub type Result<T> = std::result::Result<T, QuillError>;

impl QuillError {
    /// Create an Ollama error
    pub fn ollama(msg: impl Into<String>) -> Self {
        Self::Ollama(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a session ownership error
    pub fn session_owner(session_id: impl Into<String>, owner: impl Into<String>) -> Self {
        Self::SessionOwner {
            session_id: session_id.into(),
            owner: owner.into(),
        }
    }

    /// Create a plan parse error
    pub fn plan_parse(msg: impl Into<String>) -> Self {
        Self::PlanParse(msg.into())
    }

    /// Create a config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid message error
    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Self::InvalidMessage(msg.into())
    }
}
