//! The outbound seam between a session and its client connection.

use crate::error::ProtocolError;
use async_trait::async_trait;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

/// Channel tag for an encoded envelope.
pub const CHANNEL_ENVELOPE: u8 = 0x01;
/// Channel tag for a PCM16 audio frame.
pub const CHANNEL_AUDIO: u8 = 0x02;

/// Publishes encoded envelopes and audio frames to the remote side.
///
/// Implementations must be safe to call from several tasks at once.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish_envelope(&self, bytes: Vec<u8>) -> Result<(), ProtocolError>;
    async fn publish_audio_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError>;
}

/// A single frame on a multiplexed connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Envelope(Vec<u8>),
    Audio(Vec<u8>),
}

impl Packet {
    /// Prefixes the payload with its one-byte channel tag.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (tag, payload) = match self {
            Packet::Envelope(b) => (CHANNEL_ENVELOPE, b),
            Packet::Audio(b) => (CHANNEL_AUDIO, b),
        };
        let mut out = Vec::with_capacity(payload.len() + 1);
        out.push(tag);
        out.extend_from_slice(payload);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (tag, payload) = bytes
            .split_first()
            .ok_or_else(|| ProtocolError::Packet("empty frame".to_string()))?;
        match *tag {
            CHANNEL_ENVELOPE => Ok(Packet::Envelope(payload.to_vec())),
            CHANNEL_AUDIO => Ok(Packet::Audio(payload.to_vec())),
            other => Err(ProtocolError::Packet(format!(
                "unknown channel tag 0x{:02x}",
                other
            ))),
        }
    }
}

/// How long an envelope may wait for queue space before it is reported
/// as undelivered.
pub const ENVELOPE_SEND_TIMEOUT: Duration = Duration::from_secs(1);
/// How long an audio frame may wait for queue space. Speech is produced
/// faster than real time, so audio publishers block here while the client
/// plays out what is already queued.
pub const AUDIO_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport backed by a bounded channel drained by a connection writer.
///
/// Publishing waits for queue space. A client that stays stalled past the
/// send timeout gets a transport error instead; for envelopes the delivery
/// tracker retries, for audio the publisher abandons the sentence.
#[derive(Clone)]
pub struct ChannelTransport {
    tx: mpsc::Sender<Packet>,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Packet>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    async fn push(&self, packet: Packet, wait: Duration) -> Result<(), ProtocolError> {
        self.tx.send_timeout(packet, wait).await.map_err(|e| match e {
            mpsc::error::SendTimeoutError::Timeout(_) => {
                tracing::warn!(
                    waited_ms = wait.as_millis() as u64,
                    "outbound queue stalled; giving up on frame"
                );
                ProtocolError::Transport("outbound queue full".to_string())
            }
            mpsc::error::SendTimeoutError::Closed(_) => {
                ProtocolError::Transport("connection closed".to_string())
            }
        })
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish_envelope(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.push(Packet::Envelope(bytes), ENVELOPE_SEND_TIMEOUT).await
    }

    async fn publish_audio_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.push(Packet::Audio(frame), AUDIO_SEND_TIMEOUT).await
    }
}

/// Transport whose connection can be replaced while a session stays alive.
///
/// While detached every publish fails, which leaves tracked envelopes in the
/// delivery buffer for replay once a client reconnects.
#[derive(Default)]
pub struct SwitchableTransport {
    inner: RwLock<Option<Arc<dyn Transport>>>,
}

impl SwitchableTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, transport: Arc<dyn Transport>) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = Some(transport);
    }

    pub fn detach(&self) {
        *self.inner.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn current(&self) -> Result<Arc<dyn Transport>, ProtocolError> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| ProtocolError::Transport("no client attached".to_string()))
    }
}

#[async_trait]
impl Transport for SwitchableTransport {
    async fn publish_envelope(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        self.current()?.publish_envelope(bytes).await
    }

    async fn publish_audio_frame(&self, frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.current()?.publish_audio_frame(frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_tags() {
        let p = Packet::Audio(vec![1, 2]);
        let bytes = p.to_bytes();
        assert_eq!(bytes, vec![CHANNEL_AUDIO, 1, 2]);
        assert_eq!(Packet::from_bytes(&bytes).unwrap(), p);
        assert!(Packet::from_bytes(&[]).is_err());
        assert!(Packet::from_bytes(&[0x7f, 0]).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn channel_transport_waits_for_space() {
        let (transport, mut rx) = ChannelTransport::new(1);
        transport.publish_audio_frame(vec![1]).await.unwrap();

        let sender = transport.clone();
        let blocked = tokio::spawn(async move { sender.publish_audio_frame(vec![2]).await });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!blocked.is_finished());

        assert_eq!(rx.recv().await, Some(Packet::Audio(vec![1])));
        blocked.await.unwrap().unwrap();
        assert_eq!(rx.recv().await, Some(Packet::Audio(vec![2])));
    }

    #[tokio::test(start_paused = true)]
    async fn channel_transport_gives_up_on_stalled_client() {
        let (transport, mut rx) = ChannelTransport::new(1);
        transport.publish_envelope(vec![1]).await.unwrap();
        assert!(transport.publish_envelope(vec![2]).await.is_err());
        assert!(transport.publish_audio_frame(vec![3]).await.is_err());
        assert_eq!(rx.recv().await, Some(Packet::Envelope(vec![1])));
        drop(rx);
        assert!(transport.publish_envelope(vec![4]).await.is_err());
    }

    #[tokio::test]
    async fn switchable_transport_follows_attachment() {
        let switchable = SwitchableTransport::new();
        assert!(switchable.publish_envelope(vec![1]).await.is_err());

        let (channel, mut rx) = ChannelTransport::new(4);
        switchable.attach(Arc::new(channel));
        assert!(switchable.is_attached());
        switchable.publish_audio_frame(vec![5]).await.unwrap();
        assert_eq!(rx.recv().await, Some(Packet::Audio(vec![5])));

        switchable.detach();
        assert!(switchable.publish_envelope(vec![1]).await.is_err());
    }
}
