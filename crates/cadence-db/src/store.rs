//! Async repository implementations over the connection pool.

use crate::error::DbError;
use crate::pool::{create_pool, DbPool, DbRuntimeSettings, PoolError};
use crate::{conversations, memories, messages, run_migrations, sentences, tool_uses};
use async_trait::async_trait;
use cadence_agent::{
    ConversationRepository, MemoryRepository, MessageRepository, RepositoryError,
    SentenceRepository, ToolUseRepository,
};
use cadence_types::{Conversation, MemorySearchResult, Message, Sentence, ToolUse};
use rusqlite::Connection;
use thiserror::Error;

/// Errors raised by [`SqliteStore::open`].
#[derive(Debug, Error)]
pub enum OpenError {
    /// The pool could not be created.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// No connection was available to run migrations on.
    #[error("failed to get a connection: {0}")]
    Connection(#[from] r2d2::Error),

    /// The schema could not be brought up to date.
    #[error(transparent)]
    Migration(#[from] crate::MigrationError),
}

/// SQLite-backed store serving every agent repository.
///
/// Queries run on the blocking thread pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: DbPool,
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Creates the pool and brings the schema up to date.
    ///
    /// # Errors
    ///
    /// Returns [`OpenError`] if the pool cannot be created or a migration
    /// fails.
    pub fn open(db_path: &str, settings: DbRuntimeSettings) -> Result<Self, OpenError> {
        let pool = create_pool(db_path, settings)?;
        let applied = run_migrations(&*pool.get()?)?;
        tracing::info!(db_path, applied, "database ready");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, RepositoryError>
    where
        F: FnOnce(&Connection) -> Result<T, DbError> + Send + 'static,
        T: Send + 'static,
    {
        let pool = self.pool.clone();
        let result = tokio::task::spawn_blocking(move || {
            let conn = pool.get()?;
            f(&conn)
        })
        .await
        .map_err(DbError::from)
        .and_then(|inner| inner);

        result.map_err(|e| {
            if !matches!(e, DbError::NotFound { .. }) {
                tracing::error!("database operation failed: {}", e);
            }
            RepositoryError::from(e)
        })
    }
}

#[async_trait]
impl ConversationRepository for SqliteStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| conversations::insert_conversation(conn, &conversation))
            .await
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError> {
        let id = id.to_string();
        self.with_conn(move |conn| conversations::find_conversation(conn, &id))
            .await
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        let conversation = conversation.clone();
        self.with_conn(move |conn| conversations::update_conversation(conn, &conversation))
            .await
    }
}

#[async_trait]
impl MessageRepository for SqliteStore {
    async fn create_message(&self, message: &Message) -> Result<(), RepositoryError> {
        let message = message.clone();
        self.with_conn(move |conn| messages::insert_message(conn, &message))
            .await
    }

    async fn update_message(&self, message: &Message) -> Result<(), RepositoryError> {
        let message = message.clone();
        self.with_conn(move |conn| messages::update_message(conn, &message))
            .await
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, RepositoryError> {
        let id = id.to_string();
        self.with_conn(move |conn| messages::find_message(conn, &id))
            .await
    }

    async fn latest_by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| messages::latest_messages(conn, &conversation_id, limit))
            .await
    }

    async fn context_history(
        &self,
        conversation_id: &str,
        before_sequence: i64,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let conversation_id = conversation_id.to_string();
        self.with_conn(move |conn| {
            messages::context_history(conn, &conversation_id, before_sequence, limit)
        })
        .await
    }
}

#[async_trait]
impl SentenceRepository for SqliteStore {
    async fn create_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError> {
        let sentence = sentence.clone();
        self.with_conn(move |conn| sentences::insert_sentence(conn, &sentence))
            .await
    }

    async fn update_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError> {
        let sentence = sentence.clone();
        self.with_conn(move |conn| sentences::update_sentence(conn, &sentence))
            .await
    }

    async fn sentences_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<Sentence>, RepositoryError> {
        let message_id = message_id.to_string();
        self.with_conn(move |conn| sentences::sentences_for_message(conn, &message_id))
            .await
    }
}

#[async_trait]
impl ToolUseRepository for SqliteStore {
    async fn create_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError> {
        let tool_use = tool_use.clone();
        self.with_conn(move |conn| tool_uses::insert_tool_use(conn, &tool_use))
            .await
    }

    async fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError> {
        let tool_use = tool_use.clone();
        self.with_conn(move |conn| tool_uses::update_tool_use(conn, &tool_use))
            .await
    }

    async fn tool_uses_for_message(
        &self,
        message_id: &str,
    ) -> Result<Vec<ToolUse>, RepositoryError> {
        let message_id = message_id.to_string();
        self.with_conn(move |conn| tool_uses::tool_uses_for_message(conn, &message_id))
            .await
    }
}

#[async_trait]
impl MemoryRepository for SqliteStore {
    async fn store_memory(
        &self,
        content: &str,
        embedding: &[f32],
    ) -> Result<String, RepositoryError> {
        let content = content.to_string();
        let embedding = embedding.to_vec();
        self.with_conn(move |conn| memories::insert_memory(conn, &content, &embedding))
            .await
    }

    async fn search_memories(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<MemorySearchResult>, RepositoryError> {
        let embedding = embedding.to_vec();
        self.with_conn(move |conn| memories::search_memories(conn, &embedding, limit, min_score))
            .await
    }
}
