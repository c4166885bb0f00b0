use std::collections::HashSet;

use async_trait::async_trait;
use shared::models::{Message, Personality};
use sqlx::PgPool;
use thiserror::Error;
use tracing::instrument;

/// Failures reported by a [`ChatStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The database rejected or failed the query.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// A value could not be encoded for storage.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The addressed record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
    /// The store is temporarily unable to serve requests.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Result alias for store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Durable persistence for chats, messages, documents and user preferences.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Creates the chat record; repeated calls for the same id are accepted.
    async fn create_chat(&self, chat_id: &str, owner_id: &str) -> StoreResult<()>;

    /// Inserts or replaces a message.
    async fn create_message(&self, message: &Message) -> StoreResult<()>;

    /// Sets the chat's title.
    async fn update_chat_title(&self, chat_id: &str, title: &str) -> StoreResult<()>;

    /// Model pinned to the chat, if any.
    async fn get_chat_model(&self, chat_id: &str) -> StoreResult<Option<String>>;

    /// Pins a model to the chat.
    async fn set_chat_model(&self, chat_id: &str, model: &str) -> StoreResult<()>;

    /// Documents attached to the chat.
    async fn get_chat_document_ids(&self, chat_id: &str) -> StoreResult<HashSet<String>>;

    /// Records the personality and documents the system message was built from.
    async fn update_chat(
        &self,
        chat_id: &str,
        personality: &Personality,
        document_ids: &[String],
    ) -> StoreResult<()>;

    /// The user's preferred model.
    async fn get_model_selection(&self, user_id: &str) -> StoreResult<Option<String>>;

    /// Text of the given documents, in request order; unknown ids are skipped.
    async fn read_documents(&self, ids: &[String]) -> StoreResult<Vec<String>>;

    /// Total token count of the given documents.
    async fn document_token_count(&self, ids: &[String]) -> StoreResult<u64>;

    /// Cheap liveness probe used by readiness checks.
    async fn ping(&self) -> StoreResult<()>;
}

/// Postgres-backed [`ChatStore`]. Tables live in the `confab` schema created
/// by the bootstrap scripts.
#[derive(Clone)]
pub struct PgChatStore {
    pool: PgPool,
}

impl std::fmt::Debug for PgChatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgChatStore").finish()
    }
}

impl PgChatStore {
    /// Wraps a connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn require_row(rows_affected: u64, chat_id: &str) -> StoreResult<()> {
    if rows_affected == 0 {
        Err(StoreError::NotFound(format!("chat {chat_id}")))
    } else {
        Ok(())
    }
}

#[async_trait]
impl ChatStore for PgChatStore {
    #[instrument(name = "store.create_chat", skip(self), err)]
    async fn create_chat(&self, chat_id: &str, owner_id: &str) -> StoreResult<()> {
        sqlx::query(
            r"INSERT INTO confab.chats (id, owner_id)
              VALUES ($1, $2)
              ON CONFLICT (id) DO NOTHING",
        )
        .bind(chat_id)
        .bind(owner_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(
        name = "store.create_message",
        skip(self, message),
        fields(chat_id = %message.chat_id, message_id = %message.id),
        err
    )]
    async fn create_message(&self, message: &Message) -> StoreResult<()> {
        let content = serde_json::to_value(&message.content)?;
        sqlx::query(
            r"INSERT INTO confab.messages
                  (id, chat_id, user_id, role, content, score, context, data, created_at)
              VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
              ON CONFLICT (chat_id, id) DO UPDATE
                  SET content = EXCLUDED.content,
                      score = EXCLUDED.score,
                      context = EXCLUDED.context",
        )
        .bind(&message.id)
        .bind(&message.chat_id)
        .bind(&message.user_id)
        .bind(message.role.as_str())
        .bind(content)
        .bind(message.score)
        .bind(&message.context)
        .bind(&message.data)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(name = "store.update_chat_title", skip(self), err)]
    async fn update_chat_title(&self, chat_id: &str, title: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE confab.chats SET title = $2, updated_at = now() WHERE id = $1",
        )
        .bind(chat_id)
        .bind(title)
        .execute(&self.pool)
        .await?;
        require_row(result.rows_affected(), chat_id)
    }

    #[instrument(name = "store.get_chat_model", skip(self), err)]
    async fn get_chat_model(&self, chat_id: &str) -> StoreResult<Option<String>> {
        let model: Option<Option<String>> =
            sqlx::query_scalar("SELECT model FROM confab.chats WHERE id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(model.flatten())
    }

    #[instrument(name = "store.set_chat_model", skip(self), err)]
    async fn set_chat_model(&self, chat_id: &str, model: &str) -> StoreResult<()> {
        let result = sqlx::query(
            "UPDATE confab.chats SET model = $2, updated_at = now() WHERE id = $1",
        )
        .bind(chat_id)
        .bind(model)
        .execute(&self.pool)
        .await?;
        require_row(result.rows_affected(), chat_id)
    }

    #[instrument(name = "store.get_chat_document_ids", skip(self), err)]
    async fn get_chat_document_ids(&self, chat_id: &str) -> StoreResult<HashSet<String>> {
        let ids: Option<Vec<String>> =
            sqlx::query_scalar("SELECT document_ids FROM confab.chats WHERE id = $1")
                .bind(chat_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(ids.unwrap_or_default().into_iter().collect())
    }

    #[instrument(name = "store.update_chat", skip(self, personality), err)]
    async fn update_chat(
        &self,
        chat_id: &str,
        personality: &Personality,
        document_ids: &[String],
    ) -> StoreResult<()> {
        let personality = serde_json::to_value(personality)?;
        let result = sqlx::query(
            r"UPDATE confab.chats
              SET personality = $2, document_ids = $3, updated_at = now()
              WHERE id = $1",
        )
        .bind(chat_id)
        .bind(personality)
        .bind(document_ids)
        .execute(&self.pool)
        .await?;
        require_row(result.rows_affected(), chat_id)
    }

    #[instrument(name = "store.get_model_selection", skip(self), err)]
    async fn get_model_selection(&self, user_id: &str) -> StoreResult<Option<String>> {
        let model = sqlx::query_scalar("SELECT model FROM confab.model_selections WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(model)
    }

    #[instrument(name = "store.read_documents", skip(self), err)]
    async fn read_documents(&self, ids: &[String]) -> StoreResult<Vec<String>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let contents = sqlx::query_scalar(
            r"SELECT content FROM confab.documents
              WHERE id = ANY($1)
              ORDER BY array_position($1, id)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(contents)
    }

    #[instrument(name = "store.document_token_count", skip(self), err)]
    async fn document_token_count(&self, ids: &[String]) -> StoreResult<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(token_count), 0)::BIGINT FROM confab.documents WHERE id = ANY($1)",
        )
        .bind(ids)
        .fetch_one(&self.pool)
        .await?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    async fn ping(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
