use std::time::Duration;
use thiserror::Error;

/// Failure of a language-model or embedding call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LlmError {
    /// Worth retrying: upstream 5xx/429/408, timeouts, dropped connections.
    #[error("transient model error: {0}")]
    Transient(String),

    #[error("model error: {0}")]
    Fatal(String),

    #[error("generation cancelled")]
    Cancelled,
}

impl LlmError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Classifies an HTTP status returned by a model endpoint.
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let message = format!("HTTP {}: {}", status, body.into());
        if status >= 500 || status == 429 || status == 408 {
            Self::Transient(message)
        } else {
            Self::Fatal(message)
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RepositoryError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    NotFound(String),

    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("tool failed: {0}")]
    Execution(String),

    #[error("tool timed out after {:.1}s", .0.as_secs_f64())]
    Timeout(Duration),
}

impl ToolError {
    /// Machine-readable code sent in a tool result.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "tool_not_found",
            Self::InvalidArguments(_) => "invalid_arguments",
            Self::Execution(_) => "execution_failed",
            Self::Timeout(_) => "tool_timeout",
        }
    }
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("model error: {0}")]
    Llm(#[from] LlmError),

    #[error("protocol error: {0}")]
    Protocol(#[from] cadence_protocol::ProtocolError),

    #[error("voice error: {0}")]
    Voice(#[from] cadence_voice::VoiceError),

    #[error("invalid state transition: {0}")]
    Transition(#[from] cadence_types::TransitionError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("message already exists: {0}")]
    DuplicateMessage(String),

    #[error("conversation {id} is {status}")]
    InvalidState { id: String, status: &'static str },
}
