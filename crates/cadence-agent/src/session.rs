//! One live conversation: inbound routing, voice ingestion and the single
//! in-flight answer.

use crate::error::AgentError;
use crate::orchestrator::{GenerationHandle, ResponseOrchestrator, UserTurn};
use crate::services::AgentServices;
use async_trait::async_trait;
use cadence_protocol::{
    decode, error_codes, Body, Configuration, ControlStop, ControlVariation, DeliveryFailure,
    DeliveryTracker, Envelope, ErrorMessage, Handler, MessageType, Packet, ProtocolError, Router,
    Severity, StopType, SwitchableTransport, Transcription, UserMessage, VariationMode,
};
use cadence_types::{ids, Conversation};
use cadence_voice::{run_ingestion, TranscriptionEvent, VoiceIngestion};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Inbound audio frames buffered ahead of the voice detector.
const AUDIO_QUEUE: usize = 256;
const TRANSCRIPTION_QUEUE: usize = 16;

struct SessionCore {
    conversation_id: Arc<str>,
    outbound: DeliveryTracker,
    orchestrator: ResponseOrchestrator,
    active: tokio::sync::Mutex<Option<GenerationHandle>>,
    cancel: CancellationToken,
}

impl SessionCore {
    /// Replaces any running answer with one produced by `start`.
    async fn replace_active<F, Fut>(&self, start: F) -> Result<(), AgentError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<GenerationHandle, AgentError>>,
    {
        if self.cancel.is_cancelled() {
            return Err(AgentError::InvalidState {
                id: self.conversation_id.to_string(),
                status: "stopped",
            });
        }
        let mut active = self.active.lock().await;
        if let Some(previous) = active.take() {
            if !previous.is_finished() {
                tracing::info!(
                    message_id = %previous.message_id(),
                    "new turn interrupts the running answer"
                );
            }
            previous.stop(StopType::All);
            previous.join().await;
        }
        *active = Some(start().await?);
        Ok(())
    }

    async fn on_user_message(&self, message: UserMessage) -> Result<(), AgentError> {
        let turn = UserTurn {
            id: Some(message.id),
            previous_id: message.previous_id,
            content: message.content,
            history_before: None,
        };
        if turn.content.trim().is_empty() {
            tracing::debug!(conversation_id = %self.conversation_id, "ignoring empty user message");
            return Ok(());
        }
        match self
            .replace_active(|| self.orchestrator.respond(turn))
            .await
        {
            Err(AgentError::DuplicateMessage(id)) => {
                tracing::debug!(message_id = %id, "user message already received");
                Ok(())
            }
            other => other,
        }
    }

    async fn on_stop(&self, stop: ControlStop) {
        let mut active = self.active.lock().await;
        let Some(handle) = active.as_ref() else {
            tracing::debug!(conversation_id = %self.conversation_id, "stop with nothing running");
            return;
        };
        if let Some(target) = stop.target_id.as_deref().filter(|t| !t.is_empty()) {
            if target != handle.message_id() && target != handle.user_message_id() {
                tracing::debug!(target_id = %target, "stop target is not the running answer");
                return;
            }
        }

        tracing::info!(
            message_id = %handle.message_id(),
            stop_type = ?stop.stop_type,
            reason = stop.reason.as_deref().unwrap_or(""),
            "stopping answer"
        );
        if stop.stop_type == StopType::Speech {
            handle.stop(StopType::Speech);
            return;
        }
        if let Some(handle) = active.take() {
            handle.stop(stop.stop_type);
            handle.join().await;
        }
    }

    async fn on_variation(&self, variation: ControlVariation) -> Result<(), AgentError> {
        match variation.mode {
            VariationMode::Regenerate => {
                self.replace_active(|| self.orchestrator.regenerate(&variation.target_id))
                    .await
            }
            VariationMode::Edit => {
                let Some(content) = variation.new_content.filter(|c| !c.trim().is_empty()) else {
                    self.report(
                        error_codes::MALFORMED_DATA,
                        "edit requires new content",
                        Severity::Warning,
                        false,
                        Some(variation.target_id),
                    )
                    .await;
                    return Ok(());
                };
                self.replace_active(|| self.orchestrator.edit(&variation.target_id, content))
                    .await
            }
            VariationMode::Continue => {
                self.report(
                    error_codes::UNSUPPORTED_VARIATION,
                    "continue is not supported",
                    Severity::Warning,
                    false,
                    Some(variation.target_id),
                )
                .await;
                Ok(())
            }
        }
    }

    async fn on_configuration(&self, configuration: Configuration) {
        let outcome = self
            .outbound
            .replay_since(configuration.last_sequence_seen)
            .await;
        tracing::info!(
            conversation_id = %self.conversation_id,
            last_seen = configuration.last_sequence_seen,
            replayed = outcome.replayed,
            gap = outcome.gap,
            "client resumed"
        );
        if outcome.gap {
            self.report(
                error_codes::HISTORY_GAP,
                "some messages are no longer buffered; reload the conversation",
                Severity::Warning,
                true,
                None,
            )
            .await;
        }
    }

    async fn on_transcription(&self, event: TranscriptionEvent) {
        let transcription = Transcription {
            id: ids::generate(ids::EVENT),
            previous_id: None,
            conversation_id: self.conversation_id.to_string(),
            text: event.text.clone(),
            is_final: event.is_final,
            confidence: None,
            language: None,
            error: event.error,
        };
        if let Err(e) = self.send(Body::Transcription(transcription)).await {
            tracing::warn!(conversation_id = %self.conversation_id, "failed to send transcription: {}", e);
        }

        if !event.is_final || event.text.is_empty() {
            return;
        }
        let result = self
            .replace_active(|| self.orchestrator.respond(UserTurn::new(event.text)))
            .await;
        if let Err(e) = result {
            tracing::warn!(conversation_id = %self.conversation_id, "failed to answer spoken turn: {}", e);
        }
    }

    async fn report(
        &self,
        code: i32,
        message: &str,
        severity: Severity,
        recoverable: bool,
        originating_id: Option<String>,
    ) {
        let body = Body::Error(ErrorMessage {
            id: ids::generate(ids::EVENT),
            conversation_id: self.conversation_id.to_string(),
            code,
            message: message.to_string(),
            severity,
            recoverable,
            originating_id,
        });
        if let Err(e) = self.send(body).await {
            tracing::debug!(conversation_id = %self.conversation_id, code, "could not send error: {}", e);
        }
    }

    async fn send(&self, body: Body) -> Result<i32, ProtocolError> {
        self.outbound
            .send(Envelope::new(self.conversation_id.as_ref(), body))
            .await
    }
}

/// Routes every session-level message type into [`SessionCore`].
struct SessionHandler(Arc<SessionCore>);

#[async_trait]
impl Handler for SessionHandler {
    async fn handle(&self, envelope: Envelope) -> Result<(), ProtocolError> {
        let core = &self.0;
        let result = match envelope.body {
            Body::UserMessage(message) => core.on_user_message(message).await,
            Body::Acknowledgement(ack) => {
                if !core.outbound.acknowledge(ack.acknowledged_stanza_id) {
                    tracing::debug!(
                        stanza_id = ack.acknowledged_stanza_id,
                        "acknowledgement for unknown stanza"
                    );
                }
                Ok(())
            }
            Body::Configuration(configuration) => {
                core.on_configuration(configuration).await;
                Ok(())
            }
            Body::ControlStop(stop) => {
                core.on_stop(stop).await;
                Ok(())
            }
            Body::ControlVariation(variation) => core.on_variation(variation).await,
            _ => Ok(()),
        };
        result.map_err(|e| ProtocolError::Handler(e.to_string()))
    }
}

/// A running conversation session.
///
/// Inbound frames arrive through [`handle_frame`](Self::handle_frame).
/// Outbound envelopes and speech go to a [`SwitchableTransport`] so the
/// client connection can be swapped without losing undelivered envelopes.
pub struct AgentSession {
    core: Arc<SessionCore>,
    router: Router,
    transport: Arc<SwitchableTransport>,
    audio: Option<mpsc::Sender<Vec<u8>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl AgentSession {
    /// Starts a session for `conversation`, publishing to `transport`.
    pub async fn start(
        conversation: &Conversation,
        services: AgentServices,
        transport: Arc<SwitchableTransport>,
    ) -> Result<Self, AgentError> {
        let config = services.config.clone();
        let conversation_id: Arc<str> = Arc::from(conversation.id.as_str());

        let last_sequence = services
            .repos
            .messages
            .latest_by_conversation(&conversation.id, 1)
            .await?
            .last()
            .map(|m| m.sequence_number)
            .unwrap_or(0);

        let (outbound, failures) = DeliveryTracker::new(
            conversation.id.clone(),
            transport.clone(),
            config.delivery.to_config(),
        );
        let orchestrator = ResponseOrchestrator::new(
            conversation.id.clone(),
            services.clone(),
            outbound.clone(),
            transport.clone(),
            conversation.preferences.clone(),
            last_sequence,
        );
        let cancel = CancellationToken::new();
        let core = Arc::new(SessionCore {
            conversation_id: conversation_id.clone(),
            outbound,
            orchestrator,
            active: tokio::sync::Mutex::new(None),
            cancel: cancel.clone(),
        });

        let handler: Arc<dyn Handler> = Arc::new(SessionHandler(core.clone()));
        let mut router = Router::new();
        for message_type in [
            MessageType::UserMessage,
            MessageType::Acknowledgement,
            MessageType::Configuration,
            MessageType::ControlStop,
            MessageType::ControlVariation,
        ] {
            router.register(message_type, handler.clone());
        }

        let mut tasks = vec![tokio::spawn(log_failures(
            conversation_id.clone(),
            failures,
            cancel.clone(),
        ))];

        let mut audio = None;
        if let Some(asr) = services.asr.clone() {
            let (frames_tx, frames_rx) = mpsc::channel(AUDIO_QUEUE);
            let (events_tx, mut events_rx) = mpsc::channel(TRANSCRIPTION_QUEUE);
            tasks.push(tokio::spawn(run_ingestion(
                VoiceIngestion::new(config.vad.clone()),
                asr,
                config.asr_timeout(),
                frames_rx,
                events_tx,
                cancel.clone(),
            )));
            let forwarder = core.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    forwarder.on_transcription(event).await;
                }
            }));
            audio = Some(frames_tx);
        }

        tracing::info!(
            conversation_id = %conversation_id,
            last_sequence,
            voice_input = audio.is_some(),
            "session started"
        );

        Ok(Self {
            core,
            router,
            transport,
            audio,
            tasks: Mutex::new(tasks),
        })
    }

    pub fn conversation_id(&self) -> &str {
        &self.core.conversation_id
    }

    pub fn transport(&self) -> &Arc<SwitchableTransport> {
        &self.transport
    }

    /// Outbound envelopes sent but not yet acknowledged.
    pub fn pending_deliveries(&self) -> usize {
        self.core.outbound.pending_count()
    }

    pub fn is_stopped(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    /// Id of the assistant message currently being produced, if any.
    pub async fn active_message_id(&self) -> Option<String> {
        self.core
            .active
            .lock()
            .await
            .as_ref()
            .filter(|h| !h.is_finished())
            .map(|h| h.message_id().to_string())
    }

    /// Decodes one frame from the client connection and dispatches it.
    pub async fn handle_frame(&self, bytes: &[u8]) {
        match Packet::from_bytes(bytes) {
            Ok(Packet::Envelope(payload)) => match decode(&payload) {
                Ok(envelope) => self.handle_envelope(envelope).await,
                Err(e) => {
                    tracing::warn!(conversation_id = %self.core.conversation_id, "undecodable envelope: {}", e);
                    self.core
                        .report(error_codes::MALFORMED_DATA, &e.to_string(), Severity::Warning, true, None)
                        .await;
                }
            },
            Ok(Packet::Audio(frame)) => self.push_audio(frame),
            Err(e) => {
                tracing::warn!(conversation_id = %self.core.conversation_id, "bad frame: {}", e);
                self.core
                    .report(error_codes::MALFORMED_DATA, &e.to_string(), Severity::Warning, true, None)
                    .await;
            }
        }
    }

    /// Routes an inbound envelope and sends the acknowledgement it is owed.
    pub async fn handle_envelope(&self, envelope: Envelope) {
        if !envelope.conversation_id.is_empty()
            && envelope.conversation_id != *self.core.conversation_id
        {
            tracing::warn!(
                conversation_id = %self.core.conversation_id,
                envelope_conversation = %envelope.conversation_id,
                "envelope for another conversation"
            );
            if let Some(nack) = envelope.acknowledgement(false) {
                let _ = self.core.outbound.send(nack).await;
            }
            return;
        }

        if let Some(ack) = self.router.route(envelope).await {
            if let Err(e) = self.core.outbound.send(ack).await {
                tracing::debug!(conversation_id = %self.core.conversation_id, "could not send acknowledgement: {}", e);
            }
        }
    }

    /// Feeds one PCM16 frame to the voice detector. Frames are dropped when
    /// speech recognition is unavailable or the detector falls behind.
    pub fn push_audio(&self, frame: Vec<u8>) {
        let Some(audio) = &self.audio else {
            return;
        };
        if let Err(mpsc::error::TrySendError::Full(_)) = audio.try_send(frame) {
            tracing::debug!(conversation_id = %self.core.conversation_id, "audio queue full; dropping frame");
        }
    }

    /// Stops the running answer and every background task. Undelivered
    /// envelopes are discarded.
    pub async fn stop(&self) {
        if self.core.cancel.is_cancelled() {
            return;
        }
        self.core.cancel.cancel();

        if let Some(handle) = self.core.active.lock().await.take() {
            handle.stop(StopType::All);
            handle.join().await;
        }
        self.core.outbound.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            let _ = task.await;
        }
        tracing::info!(conversation_id = %self.core.conversation_id, "session stopped");
    }
}

async fn log_failures(
    conversation_id: Arc<str>,
    mut failures: mpsc::UnboundedReceiver<DeliveryFailure>,
    cancel: CancellationToken,
) {
    loop {
        let failure = tokio::select! {
            _ = cancel.cancelled() => return,
            f = failures.recv() => f,
        };
        let Some(failure) = failure else { return };
        tracing::warn!(
            conversation_id = %conversation_id,
            stanza_id = failure.stanza_id,
            message_type = failure.message_type,
            attempts = failure.attempts,
            "envelope was never acknowledged"
        );
    }
}
