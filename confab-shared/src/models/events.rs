//! WebSocket event names and payloads.
//!
//! Every frame is a JSON envelope `{"event": <name>, "data": <payload>}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::message::{ContentPart, Message};

/// Streamed assistant content, status markers and errors.
pub const SERVER_MESSAGE: &str = "server_message";
/// Fan-out of a participant's message to the rest of the room.
pub const CHAT_BROADCAST: &str = "chat_broadcast";
/// Title generated after the first exchange.
pub const AUTOGEN_CHAT_TITLE: &str = "autogen_chat_title";
/// Acknowledgement of an abort request.
pub const ABORT: &str = "abort";

/// Terminal marker closing every turn.
pub const DONE_MARKER: &str = "<done>";
/// The turn is waiting behind another generation.
pub const QUEUED_MARKER: &str = "<queued>";
/// A previously queued turn now holds the conversation.
pub const START_MARKER: &str = "<start>";

/// Acknowledgement text when a generation was cancelled.
pub const ABORT_OK: &str = "OK";
/// Acknowledgement text when nothing was running.
pub const ABORT_NOT_FOUND: &str = "no task found";

/// Frames sent by clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A new message for a conversation.
    ChatMessage(Message),
    /// Subscribe the connection to a conversation room.
    JoinChatRoom(JoinChatRoom),
    /// Cancel the running generation of a conversation.
    Abort(String),
}

/// Payload of [`ClientEvent::JoinChatRoom`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JoinChatRoom {
    /// Conversation to join.
    #[serde(alias = "roomId")]
    pub room_id: String,
}

/// Envelope for frames sent to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerFrame {
    /// Event name.
    pub event: String,
    /// Event payload.
    pub data: Value,
}

impl ServerFrame {
    /// Wraps `data` under `event`.
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// Status or error text addressed to a conversation, sent as a `server_message`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusMessage {
    /// Conversation the status belongs to.
    pub chat_id: String,
    /// Single text part holding the marker or error text.
    pub content: Vec<ContentPart>,
}

impl StatusMessage {
    /// Builds a status for `chat_id` carrying `text`.
    pub fn new(chat_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat_id.into(),
            content: vec![ContentPart::text(text)],
        }
    }

    /// The `<done>` marker.
    pub fn done(chat_id: impl Into<String>) -> Self {
        Self::new(chat_id, DONE_MARKER)
    }

    /// The `<queued>` marker.
    pub fn queued(chat_id: impl Into<String>) -> Self {
        Self::new(chat_id, QUEUED_MARKER)
    }

    /// The `<start>` marker.
    pub fn start(chat_id: impl Into<String>) -> Self {
        Self::new(chat_id, START_MARKER)
    }

    /// Text of the first part, if any.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        self.content.iter().find_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            ContentPart::ImageUrl { .. } => None,
        })
    }
}

/// Payload of `autogen_chat_title`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatTitle {
    /// The generated title.
    pub new_title: String,
    /// Conversation that was titled.
    pub chat_id: String,
    /// Owner of the conversation.
    pub user_id: String,
}
