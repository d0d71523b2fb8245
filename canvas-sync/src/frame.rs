//! Broker frames carried as WebSocket text messages.
//!
//! ```text
//! client → broker   {"command":"subscribe",   "destination":"/topic/whiteboard"}
//! client → broker   {"command":"unsubscribe", "destination":"/topic/whiteboard"}
//! client → broker   {"command":"send",    "destination":"/app/draw", "body":"<envelope>"}
//! broker → client   {"command":"message", "destination":"/topic/whiteboard", "body":"<envelope>"}
//! ```
//!
//! `body` is an encoded [`EventEnvelope`](crate::event::EventEnvelope); the
//! broker never looks inside it.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Frame {
    Subscribe { destination: String },
    Unsubscribe { destination: String },
    Send { destination: String, body: String },
    Message { destination: String, body: String },
}

impl Frame {
    pub fn subscribe(destination: impl Into<String>) -> Self {
        Self::Subscribe {
            destination: destination.into(),
        }
    }

    pub fn unsubscribe(destination: impl Into<String>) -> Self {
        Self::Unsubscribe {
            destination: destination.into(),
        }
    }

    pub fn send(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Send {
            destination: destination.into(),
            body: body.into(),
        }
    }

    pub fn message(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self::Message {
            destination: destination.into(),
            body: body.into(),
        }
    }

    pub fn destination(&self) -> &str {
        match self {
            Self::Subscribe { destination }
            | Self::Unsubscribe { destination }
            | Self::Send { destination, .. }
            | Self::Message { destination, .. } => destination,
        }
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self).map_err(SyncError::from)
    }

    pub fn decode(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(SyncError::from)
    }
}
