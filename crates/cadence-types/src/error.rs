use thiserror::Error;

/// A lifecycle transition that the state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// Conversation status change rejected.
    #[error("{reason}")]
    Conversation {
        from: &'static str,
        to: &'static str,
        reason: String,
    },

    /// Message completion status change rejected.
    #[error("invalid completion transition from '{from}' to '{to}'")]
    Completion { from: &'static str, to: &'static str },

    /// Tool use status change rejected.
    #[error("invalid tool status transition from '{from}' to '{to}'")]
    Tool { from: &'static str, to: &'static str },
}

/// Error returned when parsing an unknown status or role string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {kind}: {value}")]
pub struct ParseStatusError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseStatusError {
    pub(crate) fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
