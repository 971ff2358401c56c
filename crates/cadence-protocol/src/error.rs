//! Error types for the wire protocol.

/// Errors raised while encoding, decoding, routing or transmitting envelopes.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The envelope or one of its bodies could not be serialized.
    #[error("encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// The outer envelope is malformed, truncated or missing a field.
    #[error("malformed envelope: {0}")]
    Malformed(#[from] rmp_serde::decode::Error),

    /// The body did not match the layout of its declared message type.
    #[error("malformed {message_type} body: {source}")]
    Body {
        message_type: &'static str,
        #[source]
        source: rmp_serde::decode::Error,
    },

    /// A transport packet was empty or carried an unknown channel tag.
    #[error("invalid packet: {0}")]
    Packet(String),

    /// The outbound transport refused or lost the frame.
    #[error("transport error: {0}")]
    Transport(String),

    /// A registered handler failed to process an envelope.
    #[error("handler error: {0}")]
    Handler(String),
}
