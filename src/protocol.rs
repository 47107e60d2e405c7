//! Wire protocol between the browser client and a session
//!
//! Binary frames carry raw PCM audio (inbound) or synthesized speech
//! (outbound). Text frames carry JSON control commands and notifications.

use serde::{Deserialize, Serialize};

use crate::session::State;

/// Incoming control command from the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    /// Return to idle and clear captured audio
    Reset,
    /// Cancel in-flight work, then reset
    Stop,
}

impl ClientCommand {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns error if the frame is not a recognized command
    pub fn parse(text: &str) -> crate::Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Outgoing JSON notification to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Assistant state changed or an operation failed
    Status {
        status: State,
        #[serde(skip_serializing_if = "String::is_empty")]
        detail: String,
    },
    /// Transcript of the captured utterance
    Transcript {
        text: String,
        #[serde(rename = "isFinal")]
        is_final: bool,
    },
    /// Incremental reply text, one generation fragment per message
    Response { text: String },
}

impl ServerMessage {
    /// Build a status notification
    pub fn status(status: State, detail: impl Into<String>) -> Self {
        Self::Status {
            status,
            detail: detail.into(),
        }
    }
}

/// One frame queued for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// JSON text frame
    Message(ServerMessage),
    /// Synthesized audio for one sentence
    Audio(Vec<u8>),
}

impl From<ServerMessage> for OutboundFrame {
    fn from(msg: ServerMessage) -> Self {
        Self::Message(msg)
    }
}
