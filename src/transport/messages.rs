use serde::{Deserialize, Serialize};

use crate::error::SessionError;
use crate::session::transcript::Role;

/// Control message sent to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    /// Sent once when the socket opens
    Start,
    /// Sent on a deliberate stop
    End,
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Greeting,
    Response,
    Transcript,
}

/// Parsed control message from the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Something somebody said, to be added to the transcript
    Utterance {
        kind: MessageKind,
        role: Role,
        text: String,
        /// The agent is hanging up after this message
        end_call: bool,
    },
    /// A type this client does not handle
    Unknown(String),
}

/// Wire shape, validated into [`ServerMessage`]
///
/// A `role` field may be present; the speaker always follows from `type`.
#[derive(Debug, Deserialize)]
struct RawServerMessage {
    #[serde(rename = "type")]
    kind: Option<String>,
    text: Option<String>,
    #[serde(default)]
    endcall: bool,
}

impl ServerMessage {
    /// Parse a textual frame
    ///
    /// Invalid JSON, a missing `type`, or a known type without `text` is a
    /// `MalformedMessage`. Unknown types parse successfully as `Unknown`.
    pub fn parse(raw: &str) -> Result<Self, SessionError> {
        let msg: RawServerMessage = serde_json::from_str(raw)
            .map_err(|e| SessionError::MalformedMessage(format!("invalid JSON: {}", e)))?;

        let kind_name = msg
            .kind
            .ok_or_else(|| SessionError::MalformedMessage("missing type".to_string()))?;

        let kind = match kind_name.as_str() {
            "greeting" => MessageKind::Greeting,
            "response" => MessageKind::Response,
            "transcript" => MessageKind::Transcript,
            _ => return Ok(ServerMessage::Unknown(kind_name)),
        };

        let text = msg.text.ok_or_else(|| {
            SessionError::MalformedMessage(format!("{} message without text", kind_name))
        })?;

        let role = match kind {
            MessageKind::Transcript => Role::Caller,
            MessageKind::Greeting | MessageKind::Response => Role::Agent,
        };

        Ok(ServerMessage::Utterance {
            kind,
            role,
            text,
            end_call: msg.endcall,
        })
    }

    pub fn ends_call(&self) -> bool {
        matches!(self, ServerMessage::Utterance { end_call: true, .. })
    }
}
