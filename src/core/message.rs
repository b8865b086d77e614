//! Inter-agent message protocol
//!
//! A `Message` is the only thing agents exchange. It is a value object:
//! fields are private, set once by the validating constructor, and
//! compared structurally. A COMMAND is answered by exactly one terminal
//! RESPONSE or ERROR carrying the same `action` and `session_id`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::error::{QuillError, Result};

/// Key/value body of a message
pub type Payload = Map<String, Value>;

/// Kind of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Response,
    Error,
    Status,
    Feedback,
    Query,
}

impl MessageKind {
    /// RESPONSE and ERROR close a COMMAND
    pub fn is_terminal(self) -> bool {
        matches!(self, MessageKind::Response | MessageKind::Error)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageKind::Command => "command",
            MessageKind::Response => "response",
            MessageKind::Error => "error",
            MessageKind::Status => "status",
            MessageKind::Feedback => "feedback",
            MessageKind::Query => "query",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for MessageKind {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "command" => Ok(MessageKind::Command),
            "response" => Ok(MessageKind::Response),
            "error" => Ok(MessageKind::Error),
            "status" => Ok(MessageKind::Status),
            "feedback" => Ok(MessageKind::Feedback),
            "query" => Ok(MessageKind::Query),
            other => Err(QuillError::invalid_message(format!(
                "unknown message kind '{}'",
                other
            ))),
        }
    }
}

/// Participants that can send or receive messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Director,
    Planner,
    Worker,
    Reviewer,
    /// The orchestration engine driving a run
    Engine,
    /// Whoever asked for the run
    Client,
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Component::Director => "director",
            Component::Planner => "planner",
            Component::Worker => "worker",
            Component::Reviewer => "reviewer",
            Component::Engine => "engine",
            Component::Client => "client",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Component {
    type Err = QuillError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "director" => Ok(Component::Director),
            "planner" => Ok(Component::Planner),
            "worker" => Ok(Component::Worker),
            "reviewer" => Ok(Component::Reviewer),
            "engine" => Ok(Component::Engine),
            "client" => Ok(Component::Client),
            other => Err(QuillError::invalid_message(format!(
                "unknown component '{}'",
                other
            ))),
        }
    }
}

/// Immutable unit of inter-agent communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawMessage")]
pub struct Message {
    kind: MessageKind,
    sender: Component,
    receiver: Component,
    payload: Payload,
    session_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    action: Option<String>,
    timestamp: DateTime<Utc>,
}

/// Wire shape, validated into a `Message` on deserialization
#[derive(Deserialize)]
struct RawMessage {
    kind: MessageKind,
    sender: Component,
    receiver: Component,
    #[serde(default)]
    payload: Payload,
    session_id: String,
    #[serde(default)]
    action: Option<String>,
    timestamp: DateTime<Utc>,
}

impl TryFrom<RawMessage> for Message {
    type Error = QuillError;

    fn try_from(raw: RawMessage) -> Result<Self> {
        let mut message = Message::new(
            raw.kind,
            raw.sender,
            raw.receiver,
            raw.payload,
            raw.session_id,
            raw.action,
        )?;
        message.timestamp = raw.timestamp;
        Ok(message)
    }
}

impl Message {
    /// Build a message stamped with the current time
    pub fn new(
        kind: MessageKind,
        sender: Component,
        receiver: Component,
        payload: Payload,
        session_id: impl Into<String>,
        action: Option<String>,
    ) -> Result<Self> {
        let session_id = session_id.into();
        if session_id.trim().is_empty() {
            return Err(QuillError::invalid_message("session_id must not be empty"));
        }

        Ok(Self {
            kind,
            sender,
            receiver,
            payload,
            session_id,
            action,
            timestamp: Utc::now(),
        })
    }

    /// Build a message from untyped names, as received from outside the crate
    pub fn parse(
        kind: &str,
        sender: &str,
        receiver: &str,
        payload: Payload,
        session_id: impl Into<String>,
        action: Option<String>,
    ) -> Result<Self> {
        Self::new(
            kind.parse()?,
            sender.parse()?,
            receiver.parse()?,
            payload,
            session_id,
            action,
        )
    }

    /// A COMMAND for `action`
    pub fn command(
        sender: Component,
        receiver: Component,
        action: impl Into<String>,
        payload: Payload,
        session_id: impl Into<String>,
    ) -> Result<Self> {
        Self::new(
            MessageKind::Command,
            sender,
            receiver,
            payload,
            session_id,
            Some(action.into()),
        )
    }

    /// Answer to this message, swapping sender and receiver
    pub fn reply(&self, kind: MessageKind, payload: Payload) -> Self {
        Self {
            kind,
            sender: self.receiver,
            receiver: self.sender,
            payload,
            session_id: self.session_id.clone(),
            action: self.action.clone(),
            timestamp: Utc::now(),
        }
    }

    /// ERROR answer carrying `{"error": text}`
    pub fn error_reply(&self, error: impl Into<String>) -> Self {
        let mut payload = Payload::new();
        payload.insert("error".to_string(), Value::String(error.into()));
        self.reply(MessageKind::Error, payload)
    }

    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    pub fn sender(&self) -> Component {
        self.sender
    }

    pub fn receiver(&self) -> Component {
        self.receiver
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn action(&self) -> Option<&str> {
        self.action.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Whether this message closes the given command
    pub fn answers(&self, command: &Message) -> bool {
        self.kind.is_terminal()
            && self.session_id == command.session_id
            && self.action == command.action
    }
}
