//! Wire protocol for cadence conversations.
//!
//! Every unit exchanged between a client and the agent is an [`Envelope`]:
//! a stanza id, the conversation id, a string map of metadata and a typed
//! [`Body`]. Envelopes are encoded as MessagePack maps whose `body` field is
//! itself a MessagePack blob for the type named by the numeric `type` field.
//! Unknown type ids decode to [`Body::Unknown`] so newer clients can talk to
//! older servers.
//!
//! On top of the codec this crate provides:
//!
//! - [`Router`], which dispatches inbound envelopes to per-type [`Handler`]s
//!   and produces the acknowledgement owed to the sender,
//! - [`DeliveryTracker`], which allocates outbound stanza ids, keeps a
//!   bounded replay buffer and retries unacknowledged envelopes with
//!   exponential backoff,
//! - [`Transport`] and [`Packet`], the outbound seam and its channel framing.

pub mod body;
pub mod codec;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod router;
pub mod transport;

pub use body::{
    error_codes, Acknowledgement, AnswerType, AssistantMessage, AssistantSentence, AudioChunk,
    Body, Commentary, Configuration, ControlStop, ControlVariation, ErrorMessage, MemoryTrace,
    MessageType, ReasoningStep, Severity, StartAnswer, StopType, ToolExecution, ToolUseRequest,
    ToolUseResult, Transcription, UserMessage, VariationMode,
};
pub use codec::{decode, encode};
pub use delivery::{DeliveryConfig, DeliveryFailure, DeliveryTracker, ReplayOutcome};
pub use envelope::Envelope;
pub use error::ProtocolError;
pub use router::{Handler, Router};
pub use transport::{ChannelTransport, Packet, SwitchableTransport, Transport};
