//! Outbound delivery tracking.
//!
//! Every tracked envelope gets the next stanza id, is kept in a bounded
//! replay buffer and is retransmitted with exponential backoff until the
//! client acknowledges it or the attempt budget runs out. Acknowledgements
//! and errors are sent untracked with stanza id `0`.
//!
//! The buffer drops its oldest entry when full. A dropped envelope that was
//! never acknowledged is gone for good: the guarantee is at most
//! `capacity` replayable envelopes, not exactly-once delivery.

use crate::codec;
use crate::envelope::Envelope;
use crate::error::ProtocolError;
use crate::transport::Transport;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffer and retry parameters.
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    pub capacity: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Total transmissions per envelope, the first send included.
    pub max_attempts: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            max_attempts: 5,
        }
    }
}

impl DeliveryConfig {
    /// Wait after transmission number `attempt` (1-based) before checking
    /// for an acknowledgement.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Reported when an envelope exhausts its attempts without acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub stanza_id: i32,
    pub message_type: &'static str,
    pub attempts: u32,
}

/// Result of [`DeliveryTracker::replay_since`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayOutcome {
    pub replayed: usize,
    /// Envelopes newer than the client's last seen id were already dropped
    /// from the buffer and cannot be recovered.
    pub gap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryState {
    Pending,
    Acknowledged,
    Failed,
}

struct Buffered {
    stanza_id: i32,
    message_type: &'static str,
    bytes: Vec<u8>,
    state: DeliveryState,
}

struct TrackerState {
    last_stanza_id: i32,
    buffer: VecDeque<Buffered>,
}

impl TrackerState {
    fn find_mut(&mut self, stanza_id: i32) -> Option<&mut Buffered> {
        // Ids in the buffer are contiguous and ascending.
        let oldest = self.buffer.front()?.stanza_id;
        let index = usize::try_from(stanza_id.checked_sub(oldest)?).ok()?;
        self.buffer.get_mut(index)
    }
}

/// Per-session outbound delivery tracker. Cheap to clone.
#[derive(Clone)]
pub struct DeliveryTracker {
    conversation_id: Arc<str>,
    config: DeliveryConfig,
    transport: Arc<dyn Transport>,
    state: Arc<Mutex<TrackerState>>,
    failures: mpsc::UnboundedSender<DeliveryFailure>,
    cancel: CancellationToken,
}

impl DeliveryTracker {
    /// Creates a tracker and the receiver on which delivery failures are
    /// reported.
    pub fn new(
        conversation_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        config: DeliveryConfig,
    ) -> (Self, mpsc::UnboundedReceiver<DeliveryFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let tracker = Self {
            conversation_id: Arc::from(conversation_id.into()),
            config,
            transport,
            state: Arc::new(Mutex::new(TrackerState {
                last_stanza_id: 0,
                buffer: VecDeque::new(),
            })),
            failures,
            cancel: CancellationToken::new(),
        };
        (tracker, rx)
    }

    fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stanza id the next tracked [`send`](Self::send) will use.
    pub fn next_stanza_id(&self) -> i32 {
        self.state().last_stanza_id + 1
    }

    /// Sends an envelope and returns the stanza id it went out with.
    ///
    /// Tracked envelopes are buffered before the first transmission, so a
    /// transport failure here is retried rather than returned. Untracked
    /// control envelopes are sent once and transport errors propagate.
    pub async fn send(&self, mut envelope: Envelope) -> Result<i32, ProtocolError> {
        if !envelope.is_tracked() {
            envelope.stanza_id = 0;
            let bytes = codec::encode(&envelope)?;
            self.transport.publish_envelope(bytes).await?;
            return Ok(0);
        }

        let (stanza_id, bytes) = {
            let mut state = self.state();
            let stanza_id = state.last_stanza_id + 1;
            envelope.stanza_id = stanza_id;
            let bytes = codec::encode(&envelope)?;
            state.last_stanza_id = stanza_id;

            if state.buffer.len() >= self.config.capacity.max(1) {
                if let Some(dropped) = state.buffer.pop_front() {
                    if dropped.state == DeliveryState::Pending {
                        tracing::warn!(
                            conversation_id = %self.conversation_id,
                            stanza_id = dropped.stanza_id,
                            message_type = dropped.message_type,
                            "replay buffer full; dropping unacknowledged envelope"
                        );
                    }
                }
            }
            state.buffer.push_back(Buffered {
                stanza_id,
                message_type: envelope.body.type_name(),
                bytes: bytes.clone(),
                state: DeliveryState::Pending,
            });
            (stanza_id, bytes)
        };

        if let Err(e) = self.transport.publish_envelope(bytes).await {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                stanza_id,
                "initial transmission failed; will retry: {}",
                e
            );
        }
        self.spawn_retry(stanza_id);
        Ok(stanza_id)
    }

    /// Records a client acknowledgement. Returns `true` if it settled a
    /// pending envelope.
    pub fn acknowledge(&self, stanza_id: i32) -> bool {
        let mut state = self.state();
        match state.find_mut(stanza_id) {
            Some(entry) if entry.state != DeliveryState::Acknowledged => {
                entry.state = DeliveryState::Acknowledged;
                tracing::trace!(
                    conversation_id = %self.conversation_id,
                    stanza_id,
                    "envelope acknowledged"
                );
                true
            }
            _ => false,
        }
    }

    /// Retransmits every buffered envelope with an id greater than
    /// `last_seen`, oldest first.
    pub async fn replay_since(&self, last_seen: i32) -> ReplayOutcome {
        let (frames, gap, revived) = {
            let mut state = self.state();
            let gap = match state.buffer.front() {
                Some(oldest) => oldest.stanza_id > last_seen.saturating_add(1),
                None => state.last_stanza_id > last_seen,
            };
            let mut revived = Vec::new();
            let frames: Vec<Vec<u8>> = state
                .buffer
                .iter_mut()
                .filter(|e| e.stanza_id > last_seen)
                .map(|e| {
                    if e.state == DeliveryState::Failed {
                        e.state = DeliveryState::Pending;
                        revived.push(e.stanza_id);
                    }
                    e.bytes.clone()
                })
                .collect();
            (frames, gap, revived)
        };

        if gap {
            tracing::warn!(
                conversation_id = %self.conversation_id,
                last_seen,
                "replay requested beyond buffered history"
            );
        }

        let replayed = frames.len();
        for bytes in frames {
            if let Err(e) = self.transport.publish_envelope(bytes).await {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "replay transmission failed: {}",
                    e
                );
            }
        }
        for stanza_id in revived {
            self.spawn_retry(stanza_id);
        }

        tracing::info!(
            conversation_id = %self.conversation_id,
            last_seen,
            replayed,
            "replayed buffered envelopes"
        );
        ReplayOutcome { replayed, gap }
    }

    /// Number of buffered envelopes still awaiting acknowledgement.
    pub fn pending_count(&self) -> usize {
        self.state()
            .buffer
            .iter()
            .filter(|e| e.state == DeliveryState::Pending)
            .count()
    }

    /// Lowest stanza id still held in the replay buffer.
    pub fn oldest_buffered(&self) -> Option<i32> {
        self.state().buffer.front().map(|e| e.stanza_id)
    }

    /// Stops all retry timers. Buffered envelopes are kept.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    fn spawn_retry(&self, stanza_id: i32) {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.retry_loop(stanza_id).await });
    }

    async fn retry_loop(&self, stanza_id: i32) {
        let mut attempt = 1;
        loop {
            let delay = self.config.backoff(attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let bytes = {
                let mut state = self.state();
                let Some(entry) = state.find_mut(stanza_id) else {
                    return;
                };
                if entry.state != DeliveryState::Pending {
                    return;
                }
                if attempt >= self.config.max_attempts {
                    entry.state = DeliveryState::Failed;
                    let failure = DeliveryFailure {
                        stanza_id,
                        message_type: entry.message_type,
                        attempts: attempt,
                    };
                    drop(state);
                    tracing::warn!(
                        conversation_id = %self.conversation_id,
                        stanza_id,
                        attempts = attempt,
                        message_type = failure.message_type,
                        "delivery failed; giving up"
                    );
                    let _ = self.failures.send(failure);
                    return;
                }
                entry.bytes.clone()
            };

            attempt += 1;
            tracing::debug!(
                conversation_id = %self.conversation_id,
                stanza_id,
                attempt,
                "retransmitting unacknowledged envelope"
            );
            if let Err(e) = self.transport.publish_envelope(bytes).await {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    stanza_id,
                    "retransmission failed: {}",
                    e
                );
            }
        }
    }
}
