//! Conversation record and lifecycle state machine.
//!
//! ```text
//!   active ⇄ archived
//!     │         │
//!     └──► deleted ◄┘   (terminal)
//! ```

use crate::error::{ParseStatusError, TransitionError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    /// Accepting input; may own a live transport room and agent session.
    Active,
    /// Retained but idle; no room, no session.
    Archived,
    /// Terminal. No transition leaves this state.
    Deleted,
}

impl ConversationStatus {
    /// Returns the canonical string label for this status.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Returns every status reachable from `self` in one step.
    pub fn valid_targets(self) -> &'static [ConversationStatus] {
        match self {
            Self::Active => &[Self::Archived, Self::Deleted],
            Self::Archived => &[Self::Active, Self::Deleted],
            Self::Deleted => &[],
        }
    }

    /// Checks whether moving from `self` to `to` is allowed.
    ///
    /// A same-state transition is accepted as a no-op for `active` and
    /// `archived`. Nothing leaves `deleted`, including a repeated delete.
    pub fn validate_transition(self, to: ConversationStatus) -> Result<(), TransitionError> {
        if self == to && self != Self::Deleted {
            return Ok(());
        }
        if self.valid_targets().contains(&to) {
            return Ok(());
        }
        let reason = match (self, to) {
            (Self::Deleted, _) => {
                "cannot transition from deleted state: conversation is permanently deleted"
                    .to_string()
            }
            (from, to) => format!(
                "invalid conversation state transition from '{}' to '{}'",
                from.as_str(),
                to.as_str()
            ),
        };
        Err(TransitionError::Conversation {
            from: self.as_str(),
            to: to.as_str(),
            reason,
        })
    }
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ConversationStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            _ => Err(ParseStatusError::new("conversation status", s)),
        }
    }
}

/// Per-conversation preferences consulted by the agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationPreferences {
    /// TTS voice identifier. `None` uses the server default.
    #[serde(default)]
    pub voice: Option<String>,
    /// Whether assistant sentences are synthesized to audio.
    #[serde(default = "default_true")]
    pub audio_output_enabled: bool,
    /// Whether the model may call tools.
    #[serde(default = "default_true")]
    pub tools_enabled: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ConversationPreferences {
    fn default() -> Self {
        Self {
            voice: None,
            audio_output_enabled: true,
            tools_enabled: true,
        }
    }
}

/// A conversation. One conversation owns at most one live transport room and
/// at most one agent session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    /// Transport room name; equal to `id` unless the room was recreated.
    pub room_name: String,
    pub status: ConversationStatus,
    pub preferences: ConversationPreferences,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// Creates a new active conversation whose room name equals its id.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let now = Utc::now();
        Self {
            room_name: id.clone(),
            id,
            status: ConversationStatus::Active,
            preferences: ConversationPreferences::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == ConversationStatus::Active
    }

    pub fn is_deleted(&self) -> bool {
        self.status == ConversationStatus::Deleted
    }

    /// Moves the conversation to `to`, enforcing the transition table.
    ///
    /// Returns `Ok(true)` when the status changed and `Ok(false)` for an
    /// accepted no-op.
    pub fn transition(&mut self, to: ConversationStatus) -> Result<bool, TransitionError> {
        self.status.validate_transition(to)?;
        if self.status == to {
            return Ok(false);
        }
        self.status = to;
        self.updated_at = Utc::now();
        Ok(true)
    }

    pub fn archive(&mut self) -> Result<bool, TransitionError> {
        self.transition(ConversationStatus::Archived)
    }

    pub fn unarchive(&mut self) -> Result<bool, TransitionError> {
        self.transition(ConversationStatus::Active)
    }

    pub fn delete(&mut self) -> Result<bool, TransitionError> {
        self.transition(ConversationStatus::Deleted)
    }
}
