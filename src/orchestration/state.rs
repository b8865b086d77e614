//! Run state tracking
//!
//! Tracks where a top-level task is in the plan → execute → integrate flow
//! and counts what happened to its subtasks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Phase of a top-level task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessState {
    Planning,
    ExecutingSubtasks,
    Integrating,
    Completed,
    Failed,
    Cancelled,
}

impl ProcessState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProcessState::Completed | ProcessState::Failed | ProcessState::Cancelled
        )
    }

    /// Forward transitions; FAILED and CANCELLED are reachable from any live state
    fn can_move_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (_, Failed) | (_, Cancelled) => true,
            (Planning, ExecutingSubtasks) => true,
            (ExecutingSubtasks, Integrating) => true,
            (Integrating, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessState::Planning => "planning",
            ProcessState::ExecutingSubtasks => "executing_subtasks",
            ProcessState::Integrating => "integrating",
            ProcessState::Completed => "completed",
            ProcessState::Failed => "failed",
            ProcessState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// State of one run of the control loop
#[derive(Debug, Clone)]
pub struct RunState {
    pub task_id: String,
    state: ProcessState,
    /// Every state entered, in order
    transitions: Vec<ProcessState>,
    pub dispatched: usize,
    pub completed: usize,
    pub failed: usize,
    pub improvement_rounds: u32,
}

impl RunState {
    /// A run starting in PLANNING
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state: ProcessState::Planning,
            transitions: vec![ProcessState::Planning],
            dispatched: 0,
            completed: 0,
            failed: 0,
            improvement_rounds: 0,
        }
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn transitions(&self) -> &[ProcessState] {
        &self.transitions
    }

    /// Move to `next`; illegal transitions are ignored and reported as false
    pub fn advance(&mut self, next: ProcessState) -> bool {
        if !self.state.can_move_to(next) {
            tracing::warn!(task = %self.task_id, from = %self.state, to = %next, "ignored state transition");
            return false;
        }

        tracing::info!(task = %self.task_id, from = %self.state, to = %next, "run state");
        self.state = next;
        self.transitions.push(next);
        true
    }

    /// One-line progress summary
    pub fn summary(&self) -> String {
        format!(
            "{}: {} dispatched, {} completed, {} failed, {} improvement round(s)",
            self.state, self.dispatched, self.completed, self.failed, self.improvement_rounds
        )
    }
}
