//! Shared types used across Quill modules
//!
//! Tasks, plans, review and execution results, and the final run report.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::QuillError;

/// Lifecycle of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Pending,
    Planning,
    Executing,
    Reviewing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal states are kept for audit and never left again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Planning => "planning",
            TaskStatus::Executing => "executing",
            TaskStatus::Reviewing => "reviewing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Generation mode of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Stories and other open-ended prose
    #[default]
    Creative,
    /// Structured, precise output
    Coding,
    /// Factual explanations
    Research,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Creative => write!(f, "creative"),
            Mode::Coding => write!(f, "coding"),
            Mode::Research => write!(f, "research"),
        }
    }
}

impl FromStr for Mode {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "creative" => Ok(Mode::Creative),
            "coding" => Ok(Mode::Coding),
            "research" => Ok(Mode::Research),
            other => Err(QuillError::config(format!("Unknown mode: {}", other))),
        }
    }
}

const CREATIVE_KEYWORDS: &[&str] = &[
    "story", "novel", "chapter", "character", "plot", "scene", "poem", "creative", "narrative",
];
const CODING_KEYWORDS: &[&str] = &["code", "program", "implement", "function", "script"];
const ANALYSIS_KEYWORDS: &[&str] = &["analy", "research", "investigat", "survey", "compare"];

/// A unit of work, either the caller's top-level task or a planned subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Ordered requirements the output must satisfy
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default = "pending")]
    pub status: TaskStatus,
    /// Tasks that must be COMPLETED before this one runs
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    /// Explicit type used for template selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    /// Top-level task this subtask was planned from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Latest accepted output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    /// Why the task failed, if it did
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn pending() -> TaskStatus {
    TaskStatus::Pending
}

impl Task {
    /// Create a pending task
    pub fn new(
        id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: description.into(),
            requirements: Vec::new(),
            status: TaskStatus::Pending,
            depends_on: BTreeSet::new(),
            task_type: None,
            parent_id: None,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Set the requirements
    pub fn with_requirements<I, S>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requirements = requirements.into_iter().map(Into::into).collect();
        self
    }

    /// Add a dependency
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    /// Set an explicit task type
    pub fn with_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    /// Task type used to key templates: explicit type, else keyword detection
    pub fn task_type(&self) -> String {
        if let Some(ref t) = self.task_type {
            if !t.trim().is_empty() {
                return t.trim().to_lowercase();
            }
        }

        let haystack = format!("{} {}", self.title, self.description).to_lowercase();
        let matches = |words: &[&str]| words.iter().any(|w| haystack.contains(w));

        if matches(CREATIVE_KEYWORDS) {
            "creative".to_string()
        } else if matches(CODING_KEYWORDS) {
            "coding".to_string()
        } else if matches(ANALYSIS_KEYWORDS) {
            "analysis".to_string()
        } else {
            "generic".to_string()
        }
    }

    /// Move to a new status, stamping the update time
    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Decomposition of a top-level task produced by the Planner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanResult {
    pub task_id: String,
    /// Subtasks in plan order
    pub subtasks: Vec<Task>,
    pub dependencies: BTreeMap<String, BTreeSet<String>>,
    pub strategy: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Reviewer verdict on one execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewResult {
    pub task_id: String,
    /// Quality in [0, 1]
    pub score: f64,
    pub feedback: String,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl ReviewResult {
    /// Soft failure: the review text could not be interpreted
    pub fn unparsed(task_id: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            score: 0.0,
            feedback: raw.into(),
            suggestions: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }
}

/// Worker output for one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub task_id: String,
    pub content: String,
    pub requirements_met: bool,
    #[serde(default)]
    pub unmet_requirements: Vec<String>,
    /// Set when the backend kept failing and the content is a degraded answer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_error: Option<String>,
}

/// Output of an already completed task handed to its dependents
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelatedResult {
    pub task_id: String,
    pub title: String,
    pub content: String,
}

/// Extra inputs for a Worker run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Improvements requested by a prior review cycle
    #[serde(default)]
    pub improvements: Vec<String>,
    /// Content the improvements apply to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_content: Option<String>,
    /// Results of completed dependencies
    #[serde(default)]
    pub related_results: Vec<RelatedResult>,
}

/// Director's merge of all completed subtask results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationResult {
    pub task_id: String,
    pub content: String,
    /// True when generation failed and the content is a plain concatenation
    pub degraded: bool,
}

/// Overall status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Completed,
    Partial,
    Failed,
    Cancelled,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Completed => write!(f, "COMPLETED"),
            RunStatus::Partial => write!(f, "PARTIAL"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// What happened to one subtask
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtaskOutcome {
    pub task_id: String,
    pub title: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Score of the last review, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Number of improvement rounds performed (0 or 1)
    pub improvement_rounds: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubtaskOutcome {
    /// Outcome for a subtask that never produced a result
    pub fn failed(task: &Task, error: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: TaskStatus::Failed,
            content: None,
            score: None,
            improvement_rounds: 0,
            error: Some(error.into()),
        }
    }

    /// Outcome for a subtask that was never started
    pub fn cancelled(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            status: TaskStatus::Cancelled,
            content: None,
            score: None,
            improvement_rounds: 0,
            error: None,
        }
    }
}

/// Structured result of a run; every failure mode ends up here
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalResult {
    pub task_id: String,
    pub session_id: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Per-subtask outcomes in plan order
    pub subtasks: Vec<SubtaskOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FinalResult {
    /// A failed run with no usable output
    pub fn failed(
        task_id: impl Into<String>,
        session_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            session_id: session_id.into(),
            status: RunStatus::Failed,
            content: None,
            subtasks: Vec::new(),
            error: Some(error.into()),
        }
    }

    /// Subtasks that reached COMPLETED
    pub fn completed_count(&self) -> usize {
        self.subtasks
            .iter()
            .filter(|s| s.status == TaskStatus::Completed)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_type_detection() {
        let story = Task::new("t1", "Write a story", "A dragon tale");
        assert_eq!(story.task_type(), "creative");

        let code = Task::new("t2", "Implement parser", "");
        assert_eq!(code.task_type(), "coding");

        let research = Task::new("t3", "Market analysis", "");
        assert_eq!(research.task_type(), "analysis");

        let plain = Task::new("t4", "Summarize", "meeting notes");
        assert_eq!(plain.task_type(), "generic");

        let explicit = Task::new("t5", "Write a story", "").with_type("Poem");
        assert_eq!(explicit.task_type(), "poem");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Reviewing.is_terminal());
    }

    #[test]
    fn test_task_deserialize_defaults() {
        let task: Task =
            serde_json::from_str(r#"{"id":"S1","title":"Opening","description":"Set the scene"}"#)
                .unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.depends_on.is_empty());
        assert!(task.requirements.is_empty());
    }

    #[test]
    fn test_run_status_wire_format() {
        let json = serde_json::to_string(&RunStatus::Partial).unwrap();
        assert_eq!(json, "\"PARTIAL\"");
    }

    #[test]
    fn test_mode_parse() {
        assert_eq!("Coding".parse::<Mode>().unwrap(), Mode::Coding);
        assert!("poetry".parse::<Mode>().is_err());
    }
}
