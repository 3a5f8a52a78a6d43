//! Message types for the Hive line protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Reserved message type names.
///
/// The set is open: any other string is a valid type, it simply has no
/// built-in meaning.
pub struct MessageType;

impl MessageType {
    // supervisor -> worker
    pub const PING: &'static str = "ping";
    pub const USER_MESSAGE: &'static str = "user_message";
    pub const COMMAND: &'static str = "command";

    // worker -> supervisor
    pub const PONG: &'static str = "pong";
    pub const AGENT_CHAT_MESSAGE: &'static str = "agent_chat_message";
    pub const AGENT_NARRATIVE: &'static str = "agent_narrative";
    pub const STEP_UPDATE: &'static str = "step_update";
}

/// A decoded protocol frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub payload: Value,
    /// RFC 3339 timestamp set by the sender. Optional on input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl Envelope {
    /// Deserialize the payload into a typed struct.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Payload of `user_message`, `agent_chat_message` and `agent_narrative`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentPayload {
    pub content: String,
}

impl ContentPayload {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
        }
    }
}

/// Payload of `command`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: String,
}

/// Step transition reported in a `step_update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Started,
    Completed,
}

impl StepStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Payload of `step_update`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepUpdatePayload {
    pub feature_id: i64,
    pub step_index: i64,
    pub status: StepStatus,
    #[serde(default)]
    pub notes: String,
}
