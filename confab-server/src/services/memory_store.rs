use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex as StdMutex, PoisonError},
};

use async_trait::async_trait;
use shared::models::{Message, Personality};
use tokio::sync::RwLock;

use super::chat_store::{ChatStore, StoreError, StoreResult};

/// A chat record held by [`MemoryChatStore`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredChat {
    /// Owner of the chat.
    pub owner_id: String,
    /// Title, once generated.
    pub title: Option<String>,
    /// Pinned model.
    pub model: Option<String>,
    /// Personality the system message was built from.
    pub personality: Option<Personality>,
    /// Attached documents.
    pub document_ids: Vec<String>,
}

#[derive(Debug, Default)]
struct StoredDocument {
    content: String,
    token_count: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    chats: HashMap<String, StoredChat>,
    messages: Vec<Message>,
    model_selections: HashMap<String, String>,
    documents: HashMap<String, StoredDocument>,
}

/// Process-local [`ChatStore`] used when no database is configured and in tests.
///
/// Individual operations can be made to fail with [`MemoryChatStore::fail_on`].
#[derive(Debug, Default)]
pub struct MemoryChatStore {
    state: RwLock<MemoryState>,
    failing: StdMutex<HashSet<&'static str>>,
}

impl MemoryChatStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call to `operation` (the trait method name) fail.
    pub fn fail_on(&self, operation: &'static str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(operation);
    }

    /// Clears every injected failure.
    pub fn clear_failures(&self) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Adds or replaces a document.
    pub async fn insert_document(&self, id: &str, content: &str, token_count: u64) {
        self.state.write().await.documents.insert(
            id.to_string(),
            StoredDocument {
                content: content.to_string(),
                token_count,
            },
        );
    }

    /// Records a user's preferred model.
    pub async fn set_model_selection(&self, user_id: &str, model: &str) {
        self.state
            .write()
            .await
            .model_selections
            .insert(user_id.to_string(), model.to_string());
    }

    /// Snapshot of a chat record.
    pub async fn chat(&self, chat_id: &str) -> Option<StoredChat> {
        self.state.read().await.chats.get(chat_id).cloned()
    }

    /// Messages of a chat in insertion order.
    pub async fn messages(&self, chat_id: &str) -> Vec<Message> {
        self.state
            .read()
            .await
            .messages
            .iter()
            .filter(|message| message.chat_id == chat_id)
            .cloned()
            .collect()
    }

    fn check(&self, operation: &'static str) -> StoreResult<()> {
        if self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(operation)
        {
            Err(StoreError::Unavailable(format!("{operation} failed")))
        } else {
            Ok(())
        }
    }
}

fn missing(chat_id: &str) -> StoreError {
    StoreError::NotFound(format!("chat {chat_id}"))
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn create_chat(&self, chat_id: &str, owner_id: &str) -> StoreResult<()> {
        self.check("create_chat")?;
        self.state
            .write()
            .await
            .chats
            .entry(chat_id.to_string())
            .or_insert_with(|| StoredChat {
                owner_id: owner_id.to_string(),
                ..StoredChat::default()
            });
        Ok(())
    }

    async fn create_message(&self, message: &Message) -> StoreResult<()> {
        self.check("create_message")?;
        let mut state = self.state.write().await;
        if !state.chats.contains_key(&message.chat_id) {
            return Err(missing(&message.chat_id));
        }
        match state
            .messages
            .iter_mut()
            .find(|stored| stored.chat_id == message.chat_id && stored.id == message.id)
        {
            Some(stored) => *stored = message.clone(),
            None => state.messages.push(message.clone()),
        }
        Ok(())
    }

    async fn update_chat_title(&self, chat_id: &str, title: &str) -> StoreResult<()> {
        self.check("update_chat_title")?;
        let mut state = self.state.write().await;
        let chat = state.chats.get_mut(chat_id).ok_or_else(|| missing(chat_id))?;
        chat.title = Some(title.to_string());
        Ok(())
    }

    async fn get_chat_model(&self, chat_id: &str) -> StoreResult<Option<String>> {
        self.check("get_chat_model")?;
        let state = self.state.read().await;
        Ok(state.chats.get(chat_id).and_then(|chat| chat.model.clone()))
    }

    async fn set_chat_model(&self, chat_id: &str, model: &str) -> StoreResult<()> {
        self.check("set_chat_model")?;
        let mut state = self.state.write().await;
        let chat = state.chats.get_mut(chat_id).ok_or_else(|| missing(chat_id))?;
        chat.model = Some(model.to_string());
        Ok(())
    }

    async fn get_chat_document_ids(&self, chat_id: &str) -> StoreResult<HashSet<String>> {
        self.check("get_chat_document_ids")?;
        let state = self.state.read().await;
        Ok(state
            .chats
            .get(chat_id)
            .map(|chat| chat.document_ids.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn update_chat(
        &self,
        chat_id: &str,
        personality: &Personality,
        document_ids: &[String],
    ) -> StoreResult<()> {
        self.check("update_chat")?;
        let mut state = self.state.write().await;
        let chat = state.chats.get_mut(chat_id).ok_or_else(|| missing(chat_id))?;
        chat.personality = Some(personality.clone());
        chat.document_ids = document_ids.to_vec();
        Ok(())
    }

    async fn get_model_selection(&self, user_id: &str) -> StoreResult<Option<String>> {
        self.check("get_model_selection")?;
        Ok(self.state.read().await.model_selections.get(user_id).cloned())
    }

    async fn read_documents(&self, ids: &[String]) -> StoreResult<Vec<String>> {
        self.check("read_documents")?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.documents.get(id))
            .map(|document| document.content.clone())
            .collect())
    }

    async fn document_token_count(&self, ids: &[String]) -> StoreResult<u64> {
        self.check("document_token_count")?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.documents.get(id))
            .map(|document| document.token_count)
            .sum())
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check("ping")
    }
}
