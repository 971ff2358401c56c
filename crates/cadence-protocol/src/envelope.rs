use crate::body::{Acknowledgement, Body, MessageType};
use std::collections::BTreeMap;

/// Meta key carrying the sender's wall clock in milliseconds.
pub const META_TIMESTAMP: &str = "timestamp";
pub const META_CLIENT_VERSION: &str = "client_version";
pub const META_TRACE_ID: &str = "messaging.trace_id";
pub const META_SPAN_ID: &str = "messaging.span_id";

/// The unit of protocol communication.
///
/// Stanza ids are monotonic per sender. Id `0` marks control envelopes
/// (acknowledgements and errors) that are neither acknowledged nor replayed.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub stanza_id: i32,
    pub conversation_id: String,
    pub meta: BTreeMap<String, String>,
    pub body: Body,
}

impl Envelope {
    /// Creates an envelope with stanza id `0`. Outbound envelopes get their
    /// real id from the delivery tracker.
    pub fn new(conversation_id: impl Into<String>, body: Body) -> Self {
        Self {
            stanza_id: 0,
            conversation_id: conversation_id.into(),
            meta: BTreeMap::new(),
            body,
        }
    }

    pub fn with_stanza_id(mut self, stanza_id: i32) -> Self {
        self.stanza_id = stanza_id;
        self
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.meta.insert(key.into(), value.into());
        self
    }

    pub fn with_tracing(self, trace_id: &str, span_id: &str) -> Self {
        self.with_meta(META_TRACE_ID, trace_id)
            .with_meta(META_SPAN_ID, span_id)
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.body.message_type()
    }

    /// Whether delivery of this envelope should be tracked and retried.
    pub fn is_tracked(&self) -> bool {
        !matches!(self.body, Body::Acknowledgement(_) | Body::Error(_))
    }

    /// Builds the acknowledgement owed for this envelope, if any.
    pub fn acknowledgement(&self, success: bool) -> Option<Envelope> {
        if self.stanza_id == 0 || matches!(self.body, Body::Acknowledgement(_)) {
            return None;
        }
        Some(Envelope::new(
            self.conversation_id.clone(),
            Body::Acknowledgement(Acknowledgement {
                conversation_id: self.conversation_id.clone(),
                acknowledged_stanza_id: self.stanza_id,
                success,
            }),
        ))
    }
}
