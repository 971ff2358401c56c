//! Turns a user message into a streamed assistant answer.
//!
//! Each answer runs in its own task, which is the only writer of the
//! assistant message, its sentences and its tool uses. The task persists
//! the message as pending, announces it with `StartAnswer`, traces the
//! memories it retrieved, then streams model tokens through the sentence
//! segmenter. Every completed sentence is persisted, sent to the client and
//! queued for speech. Tool calls pause sentence emission until the tools
//! have run and the follow-up completion starts.

use crate::context::build_context;
use crate::error::{AgentError, LlmError, RepositoryError, ToolError};
use crate::ports::{ChatMessage, ChatRole, CompletionOptions, StreamDelta, ToolCall, ToolDefinition};
use crate::segmenter::SentenceSegmenter;
use crate::services::AgentServices;
use cadence_protocol::{
    error_codes, AnswerType, AssistantMessage, AssistantSentence, Body, DeliveryTracker, Envelope,
    ErrorMessage, MemoryTrace, ProtocolError, Severity, StartAnswer, StopType, ToolExecution,
    ToolUseRequest, ToolUseResult, Transport,
};
use cadence_types::{
    ids, CompletionStatus, ConversationPreferences, Message, Role, Sentence, ToolStatus, ToolUse,
    TransitionError,
};
use cadence_voice::{AudioOutputSynchronizer, SpeechOutcome, SynchronizerConfig};
use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A user message to answer.
#[derive(Debug, Clone, Default)]
pub struct UserTurn {
    /// Client-assigned id. Generated when absent.
    pub id: Option<String>,
    pub previous_id: Option<String>,
    pub content: String,
    /// Only messages sequenced before this number are used as history.
    /// Defaults to the new message's own sequence number.
    pub history_before: Option<i64>,
}

impl UserTurn {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }
}

/// How a generation task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Completed,
    Cancelled,
    Failed { error: String, recoverable: bool },
}

/// Control over a running answer.
#[derive(Debug)]
pub struct GenerationHandle {
    message_id: String,
    user_message_id: String,
    cancel: CancellationToken,
    speech: CancellationToken,
    task: JoinHandle<GenerationOutcome>,
}

impl GenerationHandle {
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn user_message_id(&self) -> &str {
        &self.user_message_id
    }

    /// Signals the task. Stopping speech leaves text generation running.
    pub fn stop(&self, stop_type: StopType) {
        match stop_type {
            StopType::Speech => self.speech.cancel(),
            StopType::Generation | StopType::All => self.cancel.cancel(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the task, including any speech still playing out.
    pub async fn join(self) -> GenerationOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(message_id = %self.message_id, "generation task panicked: {}", e);
                GenerationOutcome::Failed {
                    error: "generation task aborted".to_string(),
                    recoverable: false,
                }
            }
        }
    }
}

/// Starts answers for one conversation and allocates its message sequence
/// numbers.
pub struct ResponseOrchestrator {
    conversation_id: Arc<str>,
    services: AgentServices,
    outbound: DeliveryTracker,
    speech_transport: Arc<dyn Transport>,
    preferences: ConversationPreferences,
    last_sequence: AtomicI64,
}

impl ResponseOrchestrator {
    /// `last_sequence` is the highest message sequence number already
    /// persisted for the conversation.
    pub fn new(
        conversation_id: impl Into<String>,
        services: AgentServices,
        outbound: DeliveryTracker,
        speech_transport: Arc<dyn Transport>,
        preferences: ConversationPreferences,
        last_sequence: i64,
    ) -> Self {
        Self {
            conversation_id: Arc::from(conversation_id.into()),
            services,
            outbound,
            speech_transport,
            preferences,
            last_sequence: AtomicI64::new(last_sequence),
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    fn next_sequence(&self) -> i64 {
        self.last_sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Persists the user message and starts answering it.
    pub async fn respond(&self, turn: UserTurn) -> Result<GenerationHandle, AgentError> {
        let repos = &self.services.repos;
        let id = match turn.id.filter(|id| !id.is_empty()) {
            Some(id) => {
                if repos.messages.get_message(&id).await?.is_some() {
                    return Err(AgentError::DuplicateMessage(id));
                }
                id
            }
            None => ids::generate(ids::MESSAGE),
        };

        let mut user = Message::new(
            id,
            self.conversation_id.as_ref(),
            Role::User,
            self.next_sequence(),
            turn.content.trim(),
        )
        .with_previous(turn.previous_id);
        user.transition(CompletionStatus::Completed)?;
        repos.messages.create_message(&user).await?;

        let history_before = turn.history_before.unwrap_or(user.sequence_number);
        Ok(self.start(user, history_before))
    }

    /// Answers the prompt behind `target_id` again with a new assistant
    /// message. The target may be the assistant message or its prompt.
    pub async fn regenerate(&self, target_id: &str) -> Result<GenerationHandle, AgentError> {
        let user = self.prompt_for(target_id).await?;
        let history_before = user.sequence_number;
        Ok(self.start(user, history_before))
    }

    /// Sends an edited copy of the prompt behind `target_id` and answers it
    /// with the history the original prompt had.
    pub async fn edit(
        &self,
        target_id: &str,
        content: impl Into<String>,
    ) -> Result<GenerationHandle, AgentError> {
        let original = self.prompt_for(target_id).await?;
        self.respond(UserTurn {
            id: None,
            previous_id: Some(original.id.clone()),
            content: content.into(),
            history_before: Some(original.sequence_number),
        })
        .await
    }

    async fn prompt_for(&self, target_id: &str) -> Result<Message, AgentError> {
        let target = self.find_message(target_id).await?;
        match target.role {
            Role::User => Ok(target),
            Role::Assistant => {
                let prompt_id = target
                    .previous_id
                    .ok_or_else(|| AgentError::MessageNotFound(format!("prompt of {}", target_id)))?;
                let prompt = self.find_message(&prompt_id).await?;
                if prompt.role != Role::User {
                    return Err(AgentError::MessageNotFound(format!("prompt of {}", target_id)));
                }
                Ok(prompt)
            }
            Role::System => Err(AgentError::MessageNotFound(target_id.to_string())),
        }
    }

    async fn find_message(&self, id: &str) -> Result<Message, AgentError> {
        self.services
            .repos
            .messages
            .get_message(id)
            .await?
            .filter(|m| m.conversation_id == *self.conversation_id)
            .ok_or_else(|| AgentError::MessageNotFound(id.to_string()))
    }

    fn start(&self, user: Message, history_before: i64) -> GenerationHandle {
        let config = &self.services.config;
        let message = Message::new(
            ids::generate(ids::MESSAGE),
            self.conversation_id.as_ref(),
            Role::Assistant,
            self.next_sequence(),
            "",
        )
        .with_previous(Some(user.id.clone()));

        let cancel = CancellationToken::new();
        let speech_cancel = cancel.child_token();

        let mut outcomes = None;
        let speech = match &self.services.tts {
            Some(tts) if self.preferences.audio_output_enabled => {
                let (tx, rx) = mpsc::unbounded_channel();
                outcomes = Some(rx);
                Some(AudioOutputSynchronizer::start(
                    message.id.clone(),
                    tts.clone(),
                    self.speech_transport.clone(),
                    SynchronizerConfig {
                        workers: config.tts_workers,
                        tts_timeout: config.tts_timeout(),
                        output: config.output,
                        voice: self.preferences.voice.clone(),
                        window: config.speech_window,
                    },
                    Some(tx),
                    speech_cancel.clone(),
                ))
            }
            _ => None,
        };

        tracing::info!(
            conversation_id = %self.conversation_id,
            message_id = %message.id,
            user_message_id = %user.id,
            speech = speech.is_some(),
            "starting answer"
        );

        let generation = Generation {
            conversation_id: self.conversation_id.clone(),
            services: self.services.clone(),
            outbound: self.outbound.clone(),
            segmenter: SentenceSegmenter::new(&config.abbreviations, config.max_sentence_chars),
            tools_enabled: self.preferences.tools_enabled,
            user: user.clone(),
            history_before,
            message: message.clone(),
            persisted: false,
            sentences: Vec::new(),
            content: String::new(),
            speech,
            outcomes,
            cancel: cancel.clone(),
        };

        GenerationHandle {
            message_id: message.id,
            user_message_id: user.id,
            cancel,
            speech: speech_cancel,
            task: tokio::spawn(generation.run()),
        }
    }
}

enum Failure {
    Cancelled,
    Llm(LlmError),
    Internal(String),
}

impl From<LlmError> for Failure {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Cancelled => Failure::Cancelled,
            other => Failure::Llm(other),
        }
    }
}

impl From<RepositoryError> for Failure {
    fn from(e: RepositoryError) -> Self {
        Failure::Internal(e.to_string())
    }
}

impl From<ProtocolError> for Failure {
    fn from(e: ProtocolError) -> Self {
        Failure::Internal(e.to_string())
    }
}

impl From<TransitionError> for Failure {
    fn from(e: TransitionError) -> Self {
        Failure::Internal(e.to_string())
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, Failure> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Failure::Cancelled),
        value = future => Ok(value),
    }
}

#[derive(Default)]
struct Round {
    text: String,
    calls: Vec<ToolCall>,
    /// Sentences completed after the first tool call of the round.
    held: Vec<String>,
}

struct Generation {
    conversation_id: Arc<str>,
    services: AgentServices,
    outbound: DeliveryTracker,
    segmenter: SentenceSegmenter,
    tools_enabled: bool,
    user: Message,
    history_before: i64,
    message: Message,
    persisted: bool,
    sentences: Vec<Sentence>,
    content: String,
    speech: Option<AudioOutputSynchronizer>,
    outcomes: Option<mpsc::UnboundedReceiver<SpeechOutcome>>,
    cancel: CancellationToken,
}

impl Generation {
    async fn run(mut self) -> GenerationOutcome {
        let result = match self.generate().await {
            Ok(()) => self.complete().await,
            Err(failure) => Err(failure),
        };
        let outcome = match result {
            Ok(()) => GenerationOutcome::Completed,
            Err(failure) => self.fail(failure).await,
        };
        self.finish_speech().await;
        outcome
    }

    async fn generate(&mut self) -> Result<(), Failure> {
        let config = self.services.config.clone();

        self.services
            .repos
            .messages
            .create_message(&self.message)
            .await?;
        self.persisted = true;

        let answer_type = if self.speech.is_some() {
            AnswerType::TextVoice
        } else {
            AnswerType::Text
        };
        self.send(Body::StartAnswer(StartAnswer {
            id: self.message.id.clone(),
            previous_id: self.user.id.clone(),
            conversation_id: self.conversation_id.to_string(),
            answer_type: Some(answer_type),
            planned_sentence_count: 0,
        }))
        .await?;

        let search = self.services.memory.search(
            &self.user.contents,
            config.memory_top_k,
            config.memory_min_score,
        );
        let memories = match until_cancelled(&self.cancel, search).await? {
            Ok(memories) => memories,
            Err(e) => {
                tracing::warn!(
                    message_id = %self.message.id,
                    "memory retrieval failed; answering without memories: {}",
                    e
                );
                Vec::new()
            }
        };
        for memory in &memories {
            self.send(Body::MemoryTrace(MemoryTrace {
                id: ids::generate(ids::EVENT),
                message_id: self.message.id.clone(),
                conversation_id: self.conversation_id.to_string(),
                memory_id: memory.memory_id.clone(),
                content: memory.content.clone(),
                relevance: memory.score,
            }))
            .await?;
        }

        let history = self
            .services
            .repos
            .messages
            .context_history(&self.conversation_id, self.history_before, config.history_limit)
            .await?;
        let mut context = build_context(&config.system_prompt, &memories, &history, &self.user);
        let tools = if self.tools_enabled {
            self.services.tools.definitions()
        } else {
            Vec::new()
        };
        let options = CompletionOptions {
            temperature: config.temperature,
            max_tokens: config.max_tokens,
        };

        loop {
            let round = self.stream_round(&context, &tools, &options).await?;
            append_text(&mut self.content, &round.text);
            if round.calls.is_empty() {
                break;
            }

            context.push(ChatMessage {
                role: ChatRole::Assistant,
                content: round.text,
                tool_calls: round.calls.clone(),
                tool_call_id: None,
            });
            for call in &round.calls {
                let output = self.run_tool(call).await?;
                context.push(ChatMessage::tool_result(call.id.clone(), output));
            }

            let mut held = round.held;
            held.extend(self.segmenter.finish());
            for sentence in held {
                self.emit_sentence(sentence, false).await?;
            }
        }

        if let Some(rest) = self.segmenter.finish() {
            self.emit_sentence(rest, true).await?;
        }
        Ok(())
    }

    async fn stream_round(
        &mut self,
        context: &[ChatMessage],
        tools: &[ToolDefinition],
        options: &CompletionOptions,
    ) -> Result<Round, Failure> {
        let llm = self.services.llm.clone();
        let mut stream =
            until_cancelled(&self.cancel, llm.stream_completion(context, tools, options)).await??;

        if self.message.transition(CompletionStatus::Streaming)? {
            self.services
                .repos
                .messages
                .update_message(&self.message)
                .await?;
        }

        let idle = self.services.config.llm_idle_timeout();
        let mut round = Round::default();
        loop {
            let next =
                until_cancelled(&self.cancel, tokio::time::timeout(idle, stream.recv())).await?;
            let Ok(delta) = next else {
                return Err(Failure::Llm(LlmError::Transient(format!(
                    "model produced no output for {:.0}s",
                    idle.as_secs_f64()
                ))));
            };

            match delta {
                Some(StreamDelta::Token(text)) => {
                    round.text.push_str(&text);
                    let sentences = self.segmenter.push(&text);
                    if round.calls.is_empty() {
                        for sentence in sentences {
                            self.emit_sentence(sentence, false).await?;
                        }
                    } else {
                        round.held.extend(sentences);
                    }
                }
                Some(StreamDelta::ToolCall(call)) => {
                    if round.calls.is_empty() {
                        if let Some(rest) = self.segmenter.finish() {
                            self.emit_sentence(rest, false).await?;
                        }
                    }
                    tracing::debug!(
                        message_id = %self.message.id,
                        tool = %call.name,
                        "model requested tool"
                    );
                    round.calls.push(call);
                }
                Some(StreamDelta::Error(e)) => return Err(e.into()),
                Some(StreamDelta::Done) | None => return Ok(round),
            }
        }
    }

    async fn emit_sentence(&mut self, text: String, is_final: bool) -> Result<(), Failure> {
        if self.cancel.is_cancelled() {
            return Err(Failure::Cancelled);
        }
        let sequence = self.sentences.len() as u32;
        let mut sentence = Sentence::new(
            ids::generate(ids::SENTENCE),
            self.message.id.clone(),
            sequence,
            text.clone(),
        );
        sentence.is_final = is_final;
        self.services
            .repos
            .sentences
            .create_sentence(&sentence)
            .await?;

        self.send(Body::AssistantSentence(AssistantSentence {
            id: sentence.id.clone(),
            previous_id: self.message.id.clone(),
            conversation_id: self.conversation_id.to_string(),
            sequence: sequence as i32,
            text: text.clone(),
            is_final,
            audio: None,
        }))
        .await?;

        if let Some(speech) = &self.speech {
            speech.submit(sequence, text).await;
        }
        self.sentences.push(sentence);
        Ok(())
    }

    /// Runs one tool call and returns the text fed back to the model.
    async fn run_tool(&mut self, call: &ToolCall) -> Result<String, Failure> {
        let repos = self.services.repos.clone();
        let timeout = self.services.config.tool_timeout();

        let mut tool_use = ToolUse::new(
            ids::generate(ids::TOOL_USE),
            self.message.id.clone(),
            call.name.clone(),
            call.arguments.clone(),
        );
        repos.tool_uses.create_tool_use(&tool_use).await?;
        self.send(Body::ToolUseRequest(ToolUseRequest {
            id: tool_use.id.clone(),
            message_id: self.message.id.clone(),
            conversation_id: self.conversation_id.to_string(),
            tool_name: call.name.clone(),
            parameters: call.arguments.clone(),
            execution: ToolExecution::Server,
            timeout_ms: i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX),
        }))
        .await?;

        tool_use.transition(ToolStatus::Running)?;
        repos.tool_uses.update_tool_use(&tool_use).await?;

        let tools = self.services.tools.clone();
        let enabled = self.tools_enabled;
        let execution = async {
            if enabled {
                tools
                    .execute(&call.name, call.arguments.clone(), timeout)
                    .await
            } else {
                Err(ToolError::NotFound(call.name.clone()))
            }
        };
        let result = match until_cancelled(&self.cancel, execution).await {
            Ok(result) => result,
            Err(failure) => {
                tool_use.transition(ToolStatus::Cancelled)?;
                if let Err(e) = repos.tool_uses.update_tool_use(&tool_use).await {
                    tracing::warn!(tool_use_id = %tool_use.id, "failed to persist cancelled tool use: {}", e);
                }
                return Err(failure);
            }
        };

        let error = match result {
            Ok(value) => {
                tool_use.succeed(value)?;
                None
            }
            Err(e) => {
                tracing::warn!(
                    message_id = %self.message.id,
                    tool = %call.name,
                    "tool call failed: {}",
                    e
                );
                tool_use.fail(e.to_string())?;
                Some(e)
            }
        };
        repos.tool_uses.update_tool_use(&tool_use).await?;

        self.send(Body::ToolUseResult(ToolUseResult {
            id: ids::generate(ids::EVENT),
            request_id: tool_use.id.clone(),
            conversation_id: self.conversation_id.to_string(),
            success: error.is_none(),
            result: tool_use.result.clone(),
            error_code: error.as_ref().map(|e| e.code().to_string()),
            error_message: error.as_ref().map(ToString::to_string),
        }))
        .await?;

        Ok(match &error {
            Some(e) => format!("Error: {}", e),
            None => tool_use.result_text(),
        })
    }

    async fn complete(&mut self) -> Result<(), Failure> {
        let repos = self.services.repos.clone();
        for sentence in self.sentences.iter_mut().filter(|s| !s.is_final) {
            sentence.is_final = true;
            repos.sentences.update_sentence(sentence).await?;
        }

        self.message.contents = self.content.clone();
        self.message.transition(CompletionStatus::Completed)?;
        repos.messages.update_message(&self.message).await?;

        self.send(Body::AssistantMessage(AssistantMessage {
            id: self.message.id.clone(),
            previous_id: Some(self.user.id.clone()),
            conversation_id: self.conversation_id.to_string(),
            content: self.message.contents.clone(),
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }))
        .await?;

        tracing::info!(
            conversation_id = %self.conversation_id,
            message_id = %self.message.id,
            sentences = self.sentences.len(),
            "answer completed"
        );
        Ok(())
    }

    async fn fail(&mut self, failure: Failure) -> GenerationOutcome {
        if self.persisted && !self.message.is_terminal() {
            self.message.contents = self.content.clone();
            match self.message.transition(CompletionStatus::Failed) {
                Ok(_) => {
                    if let Err(e) = self.services.repos.messages.update_message(&self.message).await {
                        tracing::warn!(message_id = %self.message.id, "failed to persist failed message: {}", e);
                    }
                }
                Err(e) => tracing::warn!(message_id = %self.message.id, "{}", e),
            }
        }

        let (code, error, recoverable) = match failure {
            Failure::Cancelled => {
                tracing::info!(message_id = %self.message.id, "answer stopped");
                return GenerationOutcome::Cancelled;
            }
            Failure::Llm(e) if e.is_transient() => (error_codes::SERVICE_UNAVAILABLE, e.to_string(), true),
            Failure::Llm(e) => (error_codes::INTERNAL_ERROR, e.to_string(), false),
            Failure::Internal(e) => (error_codes::INTERNAL_ERROR, e, false),
        };
        tracing::warn!(
            conversation_id = %self.conversation_id,
            message_id = %self.message.id,
            recoverable,
            "answer failed: {}",
            error
        );

        let notice = Body::Error(ErrorMessage {
            id: ids::generate(ids::EVENT),
            conversation_id: self.conversation_id.to_string(),
            code,
            message: error.clone(),
            severity: Severity::Error,
            recoverable,
            originating_id: Some(self.message.id.clone()),
        });
        if let Err(e) = self.send(notice).await {
            tracing::debug!(message_id = %self.message.id, "could not report failure: {}", e);
        }
        GenerationOutcome::Failed { error, recoverable }
    }

    /// Waits for queued speech and attaches the synthesized audio to the
    /// persisted sentences.
    async fn finish_speech(&mut self) {
        let Some(speech) = self.speech.take() else {
            return;
        };
        let done = speech.finish();
        if let Some(mut outcomes) = self.outcomes.take() {
            while let Some(outcome) = outcomes.recv().await {
                self.attach_audio(outcome).await;
            }
        }
        match done.await {
            Ok(summary) => tracing::debug!(
                message_id = %self.message.id,
                published = summary.published.len(),
                skipped = summary.skipped.len(),
                "speech finished"
            ),
            Err(e) => tracing::warn!(message_id = %self.message.id, "speech task failed: {}", e),
        }
    }

    async fn attach_audio(&mut self, outcome: SpeechOutcome) {
        let Some(sentence) = self.sentences.get_mut(outcome.sequence as usize) else {
            return;
        };
        if outcome.audio.is_none() && outcome.duration_ms.is_none() {
            return;
        }
        sentence.audio = outcome.audio;
        sentence.duration_ms = outcome.duration_ms;
        if let Err(e) = self.services.repos.sentences.update_sentence(sentence).await {
            tracing::warn!(sentence_id = %sentence.id, "failed to store sentence audio: {}", e);
        }
    }

    async fn send(&self, body: Body) -> Result<i32, ProtocolError> {
        self.outbound
            .send(Envelope::new(self.conversation_id.as_ref(), body))
            .await
    }
}

fn append_text(content: &mut String, text: &str) {
    let text = text.trim();
    if text.is_empty() {
        return;
    }
    if !content.is_empty() {
        content.push(' ');
    }
    content.push_str(text);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounds_are_joined_with_single_spaces() {
        let mut content = String::new();
        append_text(&mut content, "  Let me check.  ");
        append_text(&mut content, "");
        append_text(&mut content, "It is 4.");
        assert_eq!(content, "Let me check. It is 4.");
    }

    #[test]
    fn llm_cancellation_is_not_a_failure() {
        assert!(matches!(Failure::from(LlmError::Cancelled), Failure::Cancelled));
        assert!(matches!(
            Failure::from(LlmError::Transient("x".into())),
            Failure::Llm(_)
        ));
    }
}
