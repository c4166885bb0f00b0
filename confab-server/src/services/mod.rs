//! Conversation services: registry, gating, persistence and generation.
pub mod chat_store;
pub mod faithfulness;
pub mod generation_manager;
pub mod generation_supervisor;
pub mod generator;
pub mod history;
pub mod memory_store;
pub mod room_hub;
pub mod session_coordinator;
pub mod system_prompt;
pub mod title;

pub use chat_store::{ChatStore, PgChatStore, StoreError};
pub use generation_manager::{GenerationManager, GenerationPermit};
pub use generator::{EchoGenerator, Generator, OpenAiGenerator};
pub use history::{HistoryHandler, HistorySettings};
pub use memory_store::MemoryChatStore;
pub use room_hub::{RoomHub, Transport};
pub use session_coordinator::{SessionCoordinator, TurnOutcome};
