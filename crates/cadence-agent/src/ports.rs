//! Collaborator interfaces consumed by the orchestrator and sessions.
//!
//! Implementations must be safe for concurrent use by many sessions.

use crate::error::{LlmError, RepositoryError};
use async_trait::async_trait;
use cadence_types::{Conversation, MemorySearchResult, Message, Sentence, ToolUse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// One entry of the model context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain(ChatRole::Assistant, content)
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::plain(ChatRole::Tool, content)
        }
    }

    fn plain(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }
}

/// Function-calling schema advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: Value,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompletionOptions {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

/// One event of a streaming completion.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamDelta {
    Token(String),
    /// A complete tool call. Argument fragments are assembled by the adapter.
    ToolCall(ToolCall),
    Error(LlmError),
    Done,
}

/// Streaming chat completion.
///
/// Dropping the returned receiver must stop the underlying request.
#[async_trait]
pub trait LlmPort: Send + Sync {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamDelta>, LlmError>;
}

#[async_trait]
pub trait EmbeddingPort: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError>;
    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError>;
    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn create_message(&self, message: &Message) -> Result<(), RepositoryError>;
    async fn update_message(&self, message: &Message) -> Result<(), RepositoryError>;
    async fn get_message(&self, id: &str) -> Result<Option<Message>, RepositoryError>;
    /// The `limit` most recent messages, oldest first.
    async fn latest_by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;
    /// The `limit` most recent messages below `before_sequence` that belong
    /// in a model context, oldest first. Failed, unfinished, empty and
    /// system messages are excluded before the limit applies.
    async fn context_history(
        &self,
        conversation_id: &str,
        before_sequence: i64,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait SentenceRepository: Send + Sync {
    async fn create_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError>;
    async fn update_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError>;
    /// Sentences of a message in sequence order.
    async fn sentences_for_message(&self, message_id: &str)
        -> Result<Vec<Sentence>, RepositoryError>;
}

#[async_trait]
pub trait ToolUseRepository: Send + Sync {
    async fn create_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError>;
    async fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError>;
    async fn tool_uses_for_message(&self, message_id: &str)
        -> Result<Vec<ToolUse>, RepositoryError>;
}

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    /// Stores a memory and returns its id.
    async fn store_memory(
        &self,
        content: &str,
        embedding: &[f32],
    ) -> Result<String, RepositoryError>;
    /// Memories ordered by similarity to `embedding`, best first, keeping
    /// only those scoring at least `min_score`.
    async fn search_memories(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<MemorySearchResult>, RepositoryError>;
}

/// The persistence collaborators of a session.
#[derive(Clone)]
pub struct Repositories {
    pub conversations: Arc<dyn ConversationRepository>,
    pub messages: Arc<dyn MessageRepository>,
    pub sentences: Arc<dyn SentenceRepository>,
    pub tool_uses: Arc<dyn ToolUseRepository>,
    pub memories: Arc<dyn MemoryRepository>,
}

impl Repositories {
    /// Uses one store for every repository.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: ConversationRepository
            + MessageRepository
            + SentenceRepository
            + ToolUseRepository
            + MemoryRepository
            + 'static,
    {
        Self {
            conversations: store.clone(),
            messages: store.clone(),
            sentences: store.clone(),
            tool_uses: store.clone(),
            memories: store,
        }
    }
}
