//! Named chat events and their JSON wire encoding.
//!
//! Every event travels as one WebSocket text frame holding a JSON object with
//! an `event` name and, for events that carry one, a `data` payload:
//!
//! ```text
//! {"event":"typing"}
//! {"event":"message","data":"hi there"}
//! {"event":"session","data":{"name":"User4821","token":"…"}}
//! ```

use crate::types::{SessionIdentity, MAX_EVENT_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Events sent by a client to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Chat text for the current peer.
    Message(String),
    /// The client is typing.
    Typing,
    /// Flag the current peer so the two are never paired again.
    Report,
    /// Leave the current peer and never be paired with them again.
    Block,
}

/// Events sent by the server to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Identity issued at connect time.
    Session(SessionIdentity),
    /// A peer was found.
    Paired,
    /// Chat text relayed from the peer, already escaped for HTML rendering.
    Message(String),
    /// The peer is typing.
    Typing,
    /// The peer left.
    Unpaired,
    /// The pair was dissolved by a block, from either side.
    Blocked,
    /// Confirms a report.
    Reported,
    /// Number of connected clients.
    Online(usize),
    /// The client's own message was refused by moderation.
    AbuseDetected(String),
}

/// Errors that can occur while decoding or encoding an event.
#[derive(Debug, Error)]
pub enum EventError {
    /// The encoded event exceeds [`MAX_EVENT_SIZE`].
    #[error("event too large: max {max}, got {actual}")]
    TooLarge {
        /// Maximum allowed size in bytes.
        max: usize,
        /// Actual size in bytes.
        actual: usize,
    },
    /// Malformed JSON or an unknown event name.
    #[error("invalid event: {0}")]
    Json(#[from] serde_json::Error),
}

fn check_size(text: &str) -> Result<(), EventError> {
    if text.len() > MAX_EVENT_SIZE {
        return Err(EventError::TooLarge {
            max: MAX_EVENT_SIZE,
            actual: text.len(),
        });
    }
    Ok(())
}

impl ClientEvent {
    /// Decodes a client event from a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the frame is oversized, is not JSON, or
    /// names an unknown event.
    ///
    /// # Examples
    ///
    /// ```
    /// use pairchat_common::event::ClientEvent;
    /// let ev = ClientEvent::parse(r#"{"event":"message","data":"hi"}"#).unwrap();
    /// assert_eq!(ev, ClientEvent::Message("hi".into()));
    /// ```
    pub fn parse(text: &str) -> Result<Self, EventError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes this event as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl ServerEvent {
    /// Decodes a server event from a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError`] if the frame is oversized, is not JSON, or
    /// names an unknown event.
    pub fn parse(text: &str) -> Result<Self, EventError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Encodes this event as a JSON text frame.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Json`] if serialization fails.
    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Wire name of the event, used for logging and metrics labels.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Session(_) => "session",
            Self::Paired => "paired",
            Self::Message(_) => "message",
            Self::Typing => "typing",
            Self::Unpaired => "unpaired",
            Self::Blocked => "blocked",
            Self::Reported => "reported",
            Self::Online(_) => "online",
            Self::AbuseDetected(_) => "abuse_detected",
        }
    }
}
