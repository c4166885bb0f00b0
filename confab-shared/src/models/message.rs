use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt::{Display, Formatter, Result as FmtResult};
use uuid::Uuid;

/// Author role of a message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Written by a person.
    #[default]
    User,
    /// Produced by the model.
    Assistant,
    /// Output of a tool call.
    Tool,
    /// Instructions and context prepended to the conversation.
    System,
}

impl MessageRole {
    /// Lowercase wire name, also used as the stored value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
            Self::System => "system",
        }
    }
}

impl Display for MessageRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        f.write_str(self.as_str())
    }
}

/// Reference to an image attached to a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImageUrl {
    /// Location of the image, either `https://` or a `data:` URI.
    pub url: String,
}

/// One ordered part of a message body.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text.
    Text {
        /// The text itself.
        text: String,
    },
    /// An image reference.
    ImageUrl {
        /// Where the image lives.
        image_url: ImageUrl,
    },
}

impl ContentPart {
    /// Builds a text part.
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// A chat message as exchanged with clients, buffered in memory and persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Message identifier, unique within a conversation.
    pub id: String,
    /// Conversation the message belongs to.
    pub chat_id: String,
    /// Author, or the user the assistant is answering.
    pub user_id: String,
    /// Ordered body.
    #[serde(default)]
    pub content: Vec<ContentPart>,
    /// Creation time.
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    /// Author role.
    #[serde(default)]
    pub role: MessageRole,
    /// Faithfulness score assigned after generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Serialized retrieval context used for the answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Free-form client data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Message {
    /// Creates an empty assistant reply addressed to `user_id`.
    pub fn assistant(chat_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let chat_id = chat_id.into();
        let user_id = user_id.into();
        Self {
            id: Uuid::new_v4().to_string(),
            data: Some(json!({ "chat_id": chat_id, "user_id": user_id })),
            chat_id,
            user_id,
            content: vec![ContentPart::text("")],
            created_at: Utc::now(),
            role: MessageRole::Assistant,
            score: None,
            context: None,
        }
    }

    /// Creates a system message carrying `text`.
    pub fn system(
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            content: vec![ContentPart::text(text)],
            created_at: Utc::now(),
            role: MessageRole::System,
            score: None,
            context: None,
            data: None,
        }
    }

    /// Creates a user message carrying `text`.
    pub fn user(
        id: impl Into<String>,
        chat_id: impl Into<String>,
        user_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            chat_id: chat_id.into(),
            user_id: user_id.into(),
            content: vec![ContentPart::text(text)],
            created_at: Utc::now(),
            role: MessageRole::User,
            score: None,
            context: None,
            data: None,
        }
    }

    /// Concatenation of every text part.
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|part| match part {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect()
    }

    /// Returns whether the body has no text and no images.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.content.iter().all(|part| match part {
            ContentPart::Text { text } => text.trim().is_empty(),
            ContentPart::ImageUrl { .. } => false,
        })
    }

    /// Appends `delta` to the trailing text part, opening one if needed.
    pub fn push_text(&mut self, delta: &str) {
        if let Some(ContentPart::Text { text }) = self.content.last_mut() {
            text.push_str(delta);
        } else {
            self.content.push(ContentPart::text(delta));
        }
    }

    /// Parses the per-turn options carried in [`Message::data`].
    ///
    /// Missing or malformed data yields the defaults.
    #[must_use]
    pub fn turn_options(&self) -> TurnOptions {
        self.data
            .as_ref()
            .and_then(|data| serde_json::from_value(data.clone()).ok())
            .unwrap_or_default()
    }
}

/// Assistant persona selected by the client for a turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct Personality {
    /// Display name.
    pub name: Option<String>,
    /// Instructions that become the system prompt.
    pub instructions: Option<String>,
    /// Tool names the persona may call.
    pub tools: Vec<String>,
    /// Documents always attached to the persona.
    pub doc_ids: Vec<String>,
}

/// Client options sent alongside a chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TurnOptions {
    /// Set on the opening message of a new conversation.
    pub first_message: bool,
    /// Active persona.
    pub personality: Personality,
    /// Documents attached to the conversation.
    pub docs: Vec<String>,
    /// Score the reply's faithfulness to the tool output it used.
    pub detect_hallucination: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_wire_format_is_camel_case() {
        let message = Message::user("m1", "c1", "u1", "hello");
        let value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["chatId"], "c1");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["role"], "user");
        assert_eq!(value["content"][0]["type"], "text");
        assert_eq!(value["content"][0]["text"], "hello");
        assert!(value.get("score").is_none());
    }

    #[test]
    fn test_minimal_inbound_message_uses_defaults() {
        let message: Message = serde_json::from_value(json!({
            "id": "m1",
            "chatId": "c1",
            "userId": "u1",
            "content": [
                { "type": "text", "text": "look at " },
                { "type": "image_url", "image_url": { "url": "https://x/y.png" } },
                { "type": "text", "text": "this" }
            ]
        }))
        .unwrap();

        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.text(), "look at this");
        assert!(!message.is_blank());
        assert_eq!(message.turn_options(), TurnOptions::default());
    }

    #[test]
    fn test_push_text_appends_to_trailing_text_part() {
        let mut reply = Message::assistant("c1", "u1");
        assert!(reply.is_blank());

        reply.push_text("Hel");
        reply.push_text("lo");
        assert_eq!(reply.content.len(), 1);
        assert_eq!(reply.text(), "Hello");
        assert_eq!(reply.data.as_ref().unwrap()["chat_id"], "c1");

        reply.content.push(ContentPart::ImageUrl {
            image_url: ImageUrl {
                url: "https://x".into(),
            },
        });
        reply.push_text("!");
        assert_eq!(reply.content.len(), 3);
    }

    #[test]
    fn test_turn_options_parse_from_client_data() {
        let mut message = Message::user("m1", "c1", "u1", "hi");
        message.data = Some(json!({
            "first_message": true,
            "docs": ["d1", "d2"],
            "personality": { "name": "Analyst", "instructions": "Be terse.", "doc_ids": ["p1"] }
        }));

        let options = message.turn_options();
        assert!(options.first_message);
        assert_eq!(options.docs, vec!["d1", "d2"]);
        assert_eq!(options.personality.instructions.as_deref(), Some("Be terse."));
        assert_eq!(options.personality.doc_ids, vec!["p1"]);
        assert!(!options.detect_hallucination);
    }
}
