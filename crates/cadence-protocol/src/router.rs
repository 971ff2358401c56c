//! Dispatch of inbound envelopes to per-type handlers.

use crate::body::{Body, MessageType};
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// Processes one kind of inbound envelope.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Result<(), ProtocolError>;
}

/// Type-keyed handler table.
#[derive(Default, Clone)]
pub struct Router {
    handlers: HashMap<MessageType, Arc<dyn Handler>>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `message_type`, replacing any previous one.
    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn Handler>) {
        self.handlers.insert(message_type, handler);
    }

    pub fn handles(&self, message_type: MessageType) -> bool {
        self.handlers.contains_key(&message_type)
    }

    /// Dispatches `envelope` and returns the acknowledgement owed to the
    /// sender, if any.
    ///
    /// Unknown or unhandled types and handler failures are logged and never
    /// propagate. Unhandled envelopes are still acknowledged as received;
    /// a failing handler yields a negative acknowledgement.
    pub async fn route(&self, envelope: Envelope) -> Option<Envelope> {
        let stanza_id = envelope.stanza_id;
        let type_id = envelope.body.type_id();

        let handler = envelope
            .message_type()
            .and_then(|t| self.handlers.get(&t).cloned());

        let Some(handler) = handler else {
            tracing::debug!(
                conversation_id = %envelope.conversation_id,
                stanza_id,
                type_id,
                "no handler for envelope type; acknowledging"
            );
            return envelope.acknowledgement(true);
        };

        let ack = envelope.acknowledgement(true);
        let conversation_id = envelope.conversation_id.clone();
        match handler.handle(envelope).await {
            Ok(()) => ack,
            Err(e) => {
                tracing::warn!(
                    conversation_id = %conversation_id,
                    stanza_id,
                    type_id,
                    "envelope handler failed: {}",
                    e
                );
                ack.map(|mut a| {
                    if let Body::Acknowledgement(ref mut body) = a.body {
                        body.success = false;
                    }
                    a
                })
            }
        }
    }
}
