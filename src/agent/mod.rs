//! Agent module - the four specialised roles
//!
//! Agents only talk through messages: a COMMAND goes in, zero or more
//! STATUS messages and exactly one RESPONSE or ERROR come out. The set of
//! roles is closed, so `Agent` is an enum rather than a trait object.

pub mod director;
pub mod planner;
pub mod reviewer;
pub mod worker;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{Component, Message, MessageKind, Mode, Payload, QuillError, Result};

pub use director::Director;
pub use planner::Planner;
pub use reviewer::Reviewer;
pub use worker::Worker;

/// Session fields injected into every command payload by the dispatcher
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionContext {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub mode: Mode,
}

/// One of the four agent roles
pub enum Agent {
    Director(Director),
    Planner(Planner),
    Worker(Worker),
    Reviewer(Reviewer),
}

impl Agent {
    pub fn component(&self) -> Component {
        match self {
            Agent::Director(_) => Component::Director,
            Agent::Planner(_) => Component::Planner,
            Agent::Worker(_) => Component::Worker,
            Agent::Reviewer(_) => Component::Reviewer,
        }
    }

    /// Handle one message; never fails, errors become an ERROR reply
    pub async fn process(&self, message: &Message) -> Vec<Message> {
        if message.kind() != MessageKind::Command {
            return vec![message.error_reply(format!(
                "unsupported message kind: {}",
                message.kind()
            ))];
        }

        let action = message.action().unwrap_or_default();
        tracing::debug!(agent = %self.component(), action, "processing command");

        let result = match self {
            Agent::Director(agent) => agent.handle(action, message).await,
            Agent::Planner(agent) => agent.handle(action, message).await,
            Agent::Worker(agent) => agent.handle(action, message).await,
            Agent::Reviewer(agent) => agent.handle(action, message).await,
        };

        match result {
            Ok(replies) => replies,
            Err(e) => {
                tracing::warn!(agent = %self.component(), action, error = %e, "command failed");
                vec![message.error_reply(e.to_string())]
            }
        }
    }
}

/// Decode a command payload into its typed parameters
pub(crate) fn decode<T: DeserializeOwned>(message: &Message) -> Result<T> {
    serde_json::from_value(Value::Object(message.payload().clone())).map_err(|e| {
        QuillError::invalid_message(format!(
            "bad payload for '{}': {}",
            message.action().unwrap_or_default(),
            e
        ))
    })
}

/// RESPONSE carrying `{"result": value}`
pub(crate) fn respond<T: Serialize>(message: &Message, value: &T) -> Result<Message> {
    let mut payload = Payload::new();
    payload.insert("result".to_string(), serde_json::to_value(value)?);
    Ok(message.reply(MessageKind::Response, payload))
}

/// Non-terminal STATUS note attached to a command
pub(crate) fn status(message: &Message, fields: Value) -> Message {
    let payload = match fields {
        Value::Object(map) => map,
        other => {
            let mut map = Payload::new();
            map.insert("status".to_string(), other);
            map
        }
    };
    message.reply(MessageKind::Status, payload)
}

/// Requirements as a template value, with a marker when there are none
pub(crate) fn requirement_list(requirements: &[String]) -> Value {
    if requirements.is_empty() {
        Value::String("(none)".to_string())
    } else {
        Value::from(requirements.to_vec())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use crate::core::Config;
    use crate::llm::{MockGenerator, ModelGateway, TemplateStore};

    /// Gateway over `mock` with tiny templates whose first word names the operation
    pub fn gateway(mock: Arc<MockGenerator>) -> ModelGateway {
        let mut config = Config::default();
        config.retry.base_delay_ms = 1;
        ModelGateway::new(mock, templates(), &config)
    }

    pub fn templates() -> TemplateStore {
        let mut t = TemplateStore::new();
        t.register(
            "planner/generic_plan",
            "PLAN {task_id} {task_title} {task_description} {requirements} {mode} {session_title}",
        );
        t.register(
            "worker/generic_execution",
            "EXECUTE {task_title} {task_description} {requirements} {mode}\nRELATED {related_results}\nPREVIOUS {previous_content}\nIMPROVE {improvements}",
        );
        t.register(
            "reviewer/generic_review",
            "REVIEW {task_title} {task_description} {requirements} {unmet_requirements} {content}",
        );
        t.register(
            "reviewer/generic_improvement",
            "SUGGEST {task_title} {score} {feedback} {suggestions} {content}",
        );
        t.register(
            "director/generic_integration",
            "INTEGRATE {task_title} {task_description} {requirements}\n{results}",
        );
        t
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Config;
    use crate::llm::MockGenerator;
    use std::sync::Arc;

    fn planner() -> Agent {
        let gateway = test_support::gateway(Arc::new(MockGenerator::new()));
        Agent::Planner(Planner::new(gateway, Arc::new(Config::default())))
    }

    #[tokio::test]
    async fn test_non_command_is_rejected() {
        let agent = planner();
        let msg = Message::new(
            MessageKind::Query,
            Component::Engine,
            Component::Planner,
            Payload::new(),
            "s1",
            Some("plan".into()),
        )
        .unwrap();

        let replies = agent.process(&msg).await;
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].kind(), MessageKind::Error);
        let error = replies[0].payload()["error"].as_str().unwrap();
        assert!(error.contains("query"));
    }

    #[tokio::test]
    async fn test_unknown_action_is_error() {
        let agent = planner();
        let msg = Message::command(
            Component::Engine,
            Component::Planner,
            "dance",
            Payload::new(),
            "s1",
        )
        .unwrap();

        let replies = agent.process(&msg).await;
        assert_eq!(replies.len(), 1);
        assert!(replies[0].answers(&msg));
        assert_eq!(replies[0].kind(), MessageKind::Error);
    }

    #[tokio::test]
    async fn test_bad_payload_is_error() {
        let agent = planner();
        let msg = Message::command(
            Component::Engine,
            Component::Planner,
            "plan",
            Payload::new(),
            "s1",
        )
        .unwrap();

        let replies = agent.process(&msg).await;
        assert_eq!(replies[0].kind(), MessageKind::Error);
        assert!(replies[0].payload()["error"]
            .as_str()
            .unwrap()
            .contains("bad payload"));
    }
}
