//! Messages and the sentences that make up a streamed assistant reply.

use crate::error::{ParseStatusError, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Author of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(ParseStatusError::new("role", s)),
        }
    }
}

/// Streaming state of a message.
///
/// Transitions only move forward:
///
/// ```text
/// pending ──► streaming ──► completed
///    │            │
///    └────────────┴──────► failed
/// ```
///
/// `pending → completed` is allowed for records that never stream (user
/// messages, finalized transcripts).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    Pending,
    Streaming,
    Completed,
    Failed,
}

impl CompletionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn can_transition_to(self, to: CompletionStatus) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Streaming)
                | (Self::Pending, Self::Completed)
                | (Self::Pending, Self::Failed)
                | (Self::Streaming, Self::Completed)
                | (Self::Streaming, Self::Failed)
        )
    }
}

impl std::str::FromStr for CompletionStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "streaming" => Ok(Self::Streaming),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(ParseStatusError::new("completion status", s)),
        }
    }
}

/// A user, assistant or system message within a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    /// Back-reference to the message this one follows or replaces.
    pub previous_id: Option<String>,
    /// Position within the conversation. Assigned once, never reused.
    pub sequence_number: i64,
    pub contents: String,
    pub completion_status: CompletionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        sequence_number: i64,
        contents: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            conversation_id: conversation_id.into(),
            role,
            previous_id: None,
            sequence_number,
            contents: contents.into(),
            completion_status: CompletionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_previous(mut self, previous_id: Option<String>) -> Self {
        self.previous_id = previous_id;
        self
    }

    /// Applies a completion status change.
    ///
    /// Returns `Ok(false)` when the message is already in `to`, which makes
    /// repeated stops idempotent.
    pub fn transition(&mut self, to: CompletionStatus) -> Result<bool, TransitionError> {
        if self.completion_status == to {
            return Ok(false);
        }
        if !self.completion_status.can_transition_to(to) {
            return Err(TransitionError::Completion {
                from: self.completion_status.as_str(),
                to: to.as_str(),
            });
        }
        self.completion_status = to;
        self.updated_at = Utc::now();
        Ok(true)
    }

    pub fn is_terminal(&self) -> bool {
        self.completion_status.is_terminal()
    }
}

/// One sentence of an assistant reply. Append-only per message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentence {
    pub id: String,
    pub message_id: String,
    /// Strictly increasing and contiguous from 0 within a message.
    pub sequence_number: u32,
    pub text: String,
    pub is_final: bool,
    /// Synthesized PCM, attached after the text has been dispatched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<Vec<u8>>,
    #[serde(default)]
    pub duration_ms: Option<u32>,
}

impl Sentence {
    pub fn new(
        id: impl Into<String>,
        message_id: impl Into<String>,
        sequence_number: u32,
        text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            message_id: message_id.into(),
            sequence_number,
            text: text.into(),
            is_final: false,
            audio: None,
            duration_ms: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_message_completes() {
        let mut msg = Message::new("msg_1", "conv_1", Role::Assistant, 2, "");
        assert!(msg.transition(CompletionStatus::Streaming).unwrap());
        assert!(msg.transition(CompletionStatus::Completed).unwrap());
        assert!(msg.is_terminal());
    }

    #[test]
    fn streaming_can_be_cancelled_into_failed() {
        let mut msg = Message::new("msg_1", "conv_1", Role::Assistant, 2, "");
        msg.transition(CompletionStatus::Streaming).unwrap();
        assert!(msg.transition(CompletionStatus::Failed).unwrap());
        // Repeating the stop is a no-op.
        assert!(!msg.transition(CompletionStatus::Failed).unwrap());
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut msg = Message::new("msg_1", "conv_1", Role::Assistant, 2, "");
        msg.transition(CompletionStatus::Completed).unwrap();
        let err = msg.transition(CompletionStatus::Failed).unwrap_err();
        assert_eq!(
            err,
            TransitionError::Completion {
                from: "completed",
                to: "failed"
            }
        );
        assert!(msg.transition(CompletionStatus::Streaming).is_err());
    }

    #[test]
    fn role_parses() {
        assert_eq!("assistant".parse::<Role>(), Ok(Role::Assistant));
        assert!("robot".parse::<Role>().is_err());
    }
}
