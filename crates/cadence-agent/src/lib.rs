//! Conversation orchestration for cadence.
//!
//! A [`SessionManager`] owns one [`AgentSession`] per live conversation.
//! Sessions route inbound protocol envelopes, feed client audio to the voice
//! detector and run at most one answer at a time through the
//! [`ResponseOrchestrator`]. Answers stream model tokens into sentences,
//! execute tool calls from the [`ToolRegistry`] and hand sentences to the
//! speech synchronizer.
//!
//! Everything outside the process (model, embeddings, storage, speech,
//! rooms) is reached through the traits in [`ports`] and `cadence_voice`.

pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod memory;
pub mod orchestrator;
pub mod ports;
pub mod segmenter;
pub mod services;
pub mod session;
pub mod tools;

pub use config::{AgentConfig, DeliverySettings};
pub use error::{AgentError, LlmError, RepositoryError, ToolError};
pub use manager::{Attachment, SessionManager};
pub use memory::MemoryRetriever;
pub use orchestrator::{GenerationHandle, GenerationOutcome, ResponseOrchestrator, UserTurn};
pub use ports::{
    ChatMessage, ChatRole, CompletionOptions, ConversationRepository, EmbeddingPort, LlmPort,
    MemoryRepository, MessageRepository, Repositories, SentenceRepository, StreamDelta, ToolCall,
    ToolDefinition, ToolUseRepository,
};
pub use segmenter::SentenceSegmenter;
pub use services::AgentServices;
pub use session::AgentSession;
pub use tools::{Calculator, MemoryQuery, Remember, Tool, ToolRegistry};
