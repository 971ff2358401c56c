//! Shared domain records and lifecycle rules for the cadence voice agent.
//!
//! This crate holds the data model that every other crate in the workspace
//! reads and writes: conversations, messages, sentences, tool uses and memory
//! search results. It also owns the transition rules for the two state
//! machines that govern them:
//!
//! - the conversation lifecycle (`active ⇄ archived`, both `→ deleted`),
//! - the per-record completion status of messages and tool uses.
//!
//! The crate is pure data. It performs no I/O and has no async runtime
//! dependency, so it can be shared by the protocol codec, the persistence
//! layer and the orchestrator without pulling anything else along.

mod conversation;
mod error;
pub mod ids;
mod memory;
mod message;
mod tool;

pub use conversation::{Conversation, ConversationPreferences, ConversationStatus};
pub use error::{ParseStatusError, TransitionError};
pub use memory::MemorySearchResult;
pub use message::{CompletionStatus, Message, Role, Sentence};
pub use tool::{ToolStatus, ToolUse};
