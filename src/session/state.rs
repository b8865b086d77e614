//! Session state
//!
//! A session owns its tasks and the message history of every dispatch made
//! on its behalf. Tasks are never removed; terminal tasks stay for audit.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{Message, Mode, Task, TaskStatus};

/// State of one orchestration session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub mode: Mode,
    /// Owner used for the per-user active cache
    pub owner: String,
    pub tasks: HashMap<String, Task>,
    /// Every message exchanged, in order
    pub history: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// Fresh empty session living for `ttl`
    pub fn new(id: impl Into<String>, owner: impl Into<String>, ttl: Duration) -> Self {
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::days(36_500));

        Self {
            id: id.into(),
            title: String::new(),
            mode: Mode::default(),
            owner: owner.into(),
            tasks: HashMap::new(),
            history: Vec::new(),
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Insert a task unless its id is already taken.
    ///
    /// Returns whether the task was added; existing tasks are never replaced.
    pub fn add_task(&mut self, task: Task) -> bool {
        if self.tasks.contains_key(&task.id) {
            return false;
        }
        self.tasks.insert(task.id.clone(), task);
        true
    }

    pub fn task(&self, id: &str) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn task_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    /// Move a task to `status`; terminal tasks are left untouched.
    ///
    /// Returns whether the status changed.
    pub fn update_task_status(&mut self, id: &str, status: TaskStatus) -> bool {
        match self.tasks.get_mut(id) {
            Some(task) if !task.status.is_terminal() => {
                task.set_status(status);
                true
            }
            _ => false,
        }
    }

    /// Append a message to the audit history
    pub fn record(&mut self, message: Message) {
        self.history.push(message);
    }

    /// Ids of tasks in `status`
    pub fn tasks_with_status(&self, status: TaskStatus) -> Vec<String> {
        let mut ids: Vec<String> = self
            .tasks
            .values()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect();
        ids.sort();
        ids
    }
}
