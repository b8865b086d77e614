//! Command dispatcher
//!
//! Fixed mapping from command name to the agent that handles it. Every
//! dispatch (the command and all replies) is appended to the session's
//! history, and every command ends with exactly one terminal reply.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::agent::Agent;
use crate::core::{Component, Message, MessageKind, Payload, QuillError, Result};
use crate::session::SessionHandle;

/// Command names and the agent each one goes to
pub const COMMANDS: &[(&str, Component)] = &[
    ("plan", Component::Planner),
    ("execute", Component::Worker),
    ("review", Component::Reviewer),
    ("suggest_improvements", Component::Reviewer),
    ("integrate_results", Component::Director),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Success,
    Failure,
}

/// Structured outcome of a dispatch; failures are values, never panics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchResult {
    pub status: DispatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DispatchResult {
    pub fn success(result: Value) -> Self {
        Self {
            status: DispatchStatus::Success,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            status: DispatchStatus::Failure,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == DispatchStatus::Success
    }

    /// Typed result, or the failure as an error
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        match (self.status, self.result) {
            (DispatchStatus::Success, Some(value)) => Ok(serde_json::from_value(value)?),
            (DispatchStatus::Success, None) => Err(QuillError::Other("empty result".to_string())),
            (DispatchStatus::Failure, _) => Err(QuillError::Other(
                self.error.unwrap_or_else(|| "unknown failure".to_string()),
            )),
        }
    }
}

/// Routes commands to agents against a session
pub struct CommandDispatcher {
    agents: HashMap<Component, Agent>,
}

impl CommandDispatcher {
    /// Dispatcher over the given agents, one per role
    pub fn new(agents: impl IntoIterator<Item = Agent>) -> Self {
        Self {
            agents: agents
                .into_iter()
                .map(|agent| (agent.component(), agent))
                .collect(),
        }
    }

    /// Agent role handling `command`, if the command is known
    pub fn route(command: &str) -> Option<Component> {
        COMMANDS
            .iter()
            .find(|(name, _)| *name == command)
            .map(|(_, component)| *component)
    }

    /// Run `command` with `params` against `session`
    pub async fn execute(
        &self,
        command: &str,
        session: &SessionHandle,
        mut params: Payload,
    ) -> DispatchResult {
        let (session_id, context) = {
            let session = session.lock().await;
            (
                session.id.clone(),
                json!({"id": session.id, "title": session.title, "mode": session.mode}),
            )
        };

        let agent = match Self::route(command).and_then(|c| self.agents.get(&c)) {
            Some(agent) => agent,
            None => {
                tracing::error!(command, session = %session_id, "unknown command");
                let mut payload = Payload::new();
                payload.insert("error".to_string(), json!("unknown command"));
                payload.insert("command".to_string(), json!(command));
                if let Ok(message) = Message::new(
                    MessageKind::Error,
                    Component::Engine,
                    Component::Client,
                    payload,
                    session_id,
                    Some(command.to_string()),
                ) {
                    session.lock().await.record(message);
                }
                return DispatchResult::failure("unknown command");
            }
        };

        params.insert("session".to_string(), context);
        let command_message = match Message::command(
            Component::Engine,
            agent.component(),
            command,
            params,
            session_id,
        ) {
            Ok(message) => message,
            Err(e) => return DispatchResult::failure(e.to_string()),
        };

        tracing::debug!(command, agent = %agent.component(), "dispatching");
        let mut replies = agent.process(&command_message).await;

        if !replies.iter().any(|m| m.answers(&command_message)) {
            replies.push(command_message.error_reply("agent produced no terminal reply"));
        }

        let result = replies
            .iter()
            .find(|m| m.answers(&command_message))
            .map(|terminal| match terminal.kind() {
                MessageKind::Response => DispatchResult::success(
                    terminal.payload().get("result").cloned().unwrap_or(Value::Null),
                ),
                _ => DispatchResult::failure(
                    terminal
                        .payload()
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown failure"),
                ),
            })
            .unwrap_or_else(|| DispatchResult::failure("agent produced no terminal reply"));

        {
            let mut session = session.lock().await;
            session.record(command_message);
            for reply in replies {
                session.record(reply);
            }
        }

        if let Some(ref error) = result.error {
            tracing::warn!(command, error = %error, "command failed");
        }
        result
    }
}
