//! Wire and domain models shared by the server and its clients.

pub mod events;
pub mod message;

pub use events::{ChatTitle, ClientEvent, JoinChatRoom, ServerFrame, StatusMessage};
pub use message::{ContentPart, ImageUrl, Message, MessageRole, Personality, TurnOptions};
