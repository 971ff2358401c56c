#![allow(dead_code)]

use async_trait::async_trait;
use cadence_agent::{
    AgentConfig, AgentServices, Calculator, ChatMessage, CompletionOptions,
    ConversationRepository, EmbeddingPort, LlmError, LlmPort, MemoryQuery, MemoryRepository,
    MemoryRetriever, MessageRepository, Remember, Repositories, RepositoryError,
    SentenceRepository, StreamDelta, ToolCall, ToolDefinition, ToolRegistry, ToolUseRepository,
};
use cadence_protocol::{decode, Body, Envelope, ProtocolError, Transport, UserMessage};
use cadence_types::{
    ids, CompletionStatus, Conversation, MemorySearchResult, Message, Role, Sentence, ToolUse,
};
use cadence_voice::{AsrPort, AudioFormat, SynthesizedAudio, TtsPort, VoiceError};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// ── storage ──

#[derive(Default)]
pub struct MemoryStore {
    conversations: Mutex<HashMap<String, Conversation>>,
    messages: Mutex<Vec<Message>>,
    sentences: Mutex<Vec<Sentence>>,
    tool_uses: Mutex<Vec<ToolUse>>,
    memories: Mutex<Vec<(String, String, Vec<f32>)>>,
}

impl MemoryStore {
    pub fn conversation(&self, id: &str) -> Option<Conversation> {
        self.conversations.lock().unwrap().get(id).cloned()
    }

    pub fn message(&self, id: &str) -> Option<Message> {
        self.messages
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .messages
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        messages.sort_by_key(|m| m.sequence_number);
        messages
    }

    pub fn sentences(&self, message_id: &str) -> Vec<Sentence> {
        let mut sentences: Vec<Sentence> = self
            .sentences
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.message_id == message_id)
            .cloned()
            .collect();
        sentences.sort_by_key(|s| s.sequence_number);
        sentences
    }

    pub fn tool_uses(&self, message_id: &str) -> Vec<ToolUse> {
        self.tool_uses
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.message_id == message_id)
            .cloned()
            .collect()
    }
}

fn replace<T: Clone>(items: &Mutex<Vec<T>>, item: &T, same: impl Fn(&T) -> bool) -> Result<(), RepositoryError> {
    let mut items = items.lock().unwrap();
    match items.iter_mut().find(|i| same(i)) {
        Some(slot) => {
            *slot = item.clone();
            Ok(())
        }
        None => Err(RepositoryError::NotFound {
            kind: "record",
            id: String::new(),
        }),
    }
}

#[async_trait]
impl ConversationRepository for MemoryStore {
    async fn create_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        self.conversations
            .lock()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>, RepositoryError> {
        Ok(self.conversation(id))
    }

    async fn update_conversation(&self, conversation: &Conversation) -> Result<(), RepositoryError> {
        self.create_conversation(conversation).await
    }
}

#[async_trait]
impl MessageRepository for MemoryStore {
    async fn create_message(&self, message: &Message) -> Result<(), RepositoryError> {
        self.messages.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn update_message(&self, message: &Message) -> Result<(), RepositoryError> {
        replace(&self.messages, message, |m| m.id == message.id)
    }

    async fn get_message(&self, id: &str) -> Result<Option<Message>, RepositoryError> {
        Ok(self.message(id))
    }

    async fn latest_by_conversation(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages(conversation_id);
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn context_history(
        &self,
        conversation_id: &str,
        before_sequence: i64,
        limit: usize,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages: Vec<Message> = self
            .messages(conversation_id)
            .into_iter()
            .filter(|m| {
                m.sequence_number < before_sequence
                    && m.role != Role::System
                    && m.completion_status == CompletionStatus::Completed
                    && !m.contents.trim().is_empty()
            })
            .collect();
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }
}

#[async_trait]
impl SentenceRepository for MemoryStore {
    async fn create_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError> {
        self.sentences.lock().unwrap().push(sentence.clone());
        Ok(())
    }

    async fn update_sentence(&self, sentence: &Sentence) -> Result<(), RepositoryError> {
        replace(&self.sentences, sentence, |s| s.id == sentence.id)
    }

    async fn sentences_for_message(&self, message_id: &str) -> Result<Vec<Sentence>, RepositoryError> {
        Ok(self.sentences(message_id))
    }
}

#[async_trait]
impl ToolUseRepository for MemoryStore {
    async fn create_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError> {
        self.tool_uses.lock().unwrap().push(tool_use.clone());
        Ok(())
    }

    async fn update_tool_use(&self, tool_use: &ToolUse) -> Result<(), RepositoryError> {
        replace(&self.tool_uses, tool_use, |t| t.id == tool_use.id)
    }

    async fn tool_uses_for_message(&self, message_id: &str) -> Result<Vec<ToolUse>, RepositoryError> {
        Ok(self.tool_uses(message_id))
    }
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

#[async_trait]
impl MemoryRepository for MemoryStore {
    async fn store_memory(&self, content: &str, embedding: &[f32]) -> Result<String, RepositoryError> {
        let id = ids::generate(ids::MEMORY);
        self.memories
            .lock()
            .unwrap()
            .push((id.clone(), content.to_string(), embedding.to_vec()));
        Ok(id)
    }

    async fn search_memories(
        &self,
        embedding: &[f32],
        limit: usize,
        min_score: f32,
    ) -> Result<Vec<MemorySearchResult>, RepositoryError> {
        let mut results: Vec<MemorySearchResult> = self
            .memories
            .lock()
            .unwrap()
            .iter()
            .map(|(id, content, e)| MemorySearchResult {
                memory_id: id.clone(),
                score: cosine(embedding, e),
                content: content.clone(),
            })
            .filter(|r| r.score >= min_score)
            .collect();
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(limit);
        Ok(results)
    }
}

// ── model ──

/// One scripted action of a fake completion stream.
#[derive(Debug, Clone)]
pub enum Step {
    Token(&'static str),
    Call(&'static str, Value),
    Fail(LlmError),
    Pause(Duration),
    /// Keep the stream open until the receiver goes away.
    Hang,
}

#[derive(Default)]
pub struct ScriptedLlm {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Mutex<Vec<(Vec<ChatMessage>, Vec<String>)>>,
    calls: AtomicUsize,
}

impl ScriptedLlm {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    pub fn push(&self, script: Vec<Step>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Context of every completion request so far.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(m, _)| m.clone())
            .collect()
    }

    /// Tool names advertised with every request.
    pub fn advertised_tools(&self) -> Vec<Vec<String>> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait]
impl LlmPort for ScriptedLlm {
    async fn stream_completion(
        &self,
        messages: &[ChatMessage],
        tools: &[ToolDefinition],
        _options: &CompletionOptions,
    ) -> Result<mpsc::Receiver<StreamDelta>, LlmError> {
        self.requests.lock().unwrap().push((
            messages.to_vec(),
            tools.iter().map(|t| t.name.clone()).collect(),
        ));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::Fatal("no scripted response".to_string()))?;
        let round = self.calls.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(async move {
            for (i, step) in script.into_iter().enumerate() {
                let delta = match step {
                    Step::Token(text) => StreamDelta::Token(text.to_string()),
                    Step::Call(name, arguments) => StreamDelta::ToolCall(ToolCall {
                        id: format!("call_{}_{}", round, i),
                        name: name.to_string(),
                        arguments,
                    }),
                    Step::Fail(e) => {
                        let _ = tx.send(StreamDelta::Error(e)).await;
                        return;
                    }
                    Step::Pause(d) => {
                        tokio::time::sleep(d).await;
                        continue;
                    }
                    Step::Hang => {
                        tx.closed().await;
                        return;
                    }
                };
                if tx.send(delta).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(StreamDelta::Done).await;
        });
        Ok(rx)
    }
}

/// Embeds text as keyword presence, enough for similarity tests.
pub struct KeywordEmbedder;

const KEYWORDS: [&str; 4] = ["tea", "oslo", "dog", "piano"];

#[async_trait]
impl EmbeddingPort for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let text = text.to_lowercase();
        Ok(KEYWORDS
            .iter()
            .map(|k| if text.contains(k) { 1.0 } else { 0.0 })
            .collect())
    }
}

// ── speech ──

/// Returns 20ms of 8kHz tone per sentence, failing for texts containing
/// `fail_on`.
#[derive(Default)]
pub struct FakeTts {
    pub fail_on: Option<&'static str>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl TtsPort for FakeTts {
    async fn synthesize(&self, text: &str, _voice: Option<&str>) -> Result<SynthesizedAudio, VoiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.is_some_and(|f| text.contains(f)) {
            return Err(VoiceError::Tts("synthesizer crashed".to_string()));
        }
        Ok(SynthesizedAudio {
            pcm: tone(160, 4000),
            sample_rate: 8_000,
        })
    }
}

pub struct FixedAsr(pub &'static str);

#[async_trait]
impl AsrPort for FixedAsr {
    async fn transcribe(&self, _audio: &[u8], _format: AudioFormat) -> Result<String, VoiceError> {
        Ok(self.0.to_string())
    }
}

/// Mono PCM16 square wave.
pub fn tone(samples: usize, amplitude: i16) -> Vec<u8> {
    (0..samples)
        .flat_map(|i| {
            let s = if i % 8 < 4 { amplitude } else { -amplitude };
            s.to_le_bytes()
        })
        .collect()
}

// ── client ──

/// Client side of a session: decodes everything published to it.
#[derive(Default)]
pub struct RecordingClient {
    envelopes: Mutex<Vec<Envelope>>,
    audio_frames: AtomicUsize,
}

impl RecordingClient {
    /// Received envelopes with retransmissions removed, in arrival order.
    pub fn envelopes(&self) -> Vec<Envelope> {
        let mut seen = HashSet::new();
        self.envelopes
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.stanza_id == 0 || seen.insert(e.stanza_id))
            .cloned()
            .collect()
    }

    /// Every transmission, retransmissions included.
    pub fn transmissions(&self) -> Vec<Envelope> {
        self.envelopes.lock().unwrap().clone()
    }

    /// Received bodies, excluding acknowledgements.
    pub fn bodies(&self) -> Vec<Body> {
        self.envelopes()
            .into_iter()
            .map(|e| e.body)
            .filter(|b| !matches!(b, Body::Acknowledgement(_)))
            .collect()
    }

    pub fn audio_frames(&self) -> usize {
        self.audio_frames.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.envelopes.lock().unwrap().clear();
    }

    /// Polls until `done` holds for the received bodies.
    pub async fn wait_for(&self, what: &str, done: impl Fn(&[Body]) -> bool) -> Vec<Body> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let bodies = self.bodies();
            if done(&bodies) {
                return bodies;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {}; received {:#?}", what, bodies);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    pub async fn wait_for_answer(&self) -> Vec<Body> {
        self.wait_for("assistant message", |b| {
            b.iter().any(|b| matches!(b, Body::AssistantMessage(_)))
        })
        .await
    }
}

#[async_trait]
impl Transport for RecordingClient {
    async fn publish_envelope(&self, bytes: Vec<u8>) -> Result<(), ProtocolError> {
        let envelope = decode(&bytes)?;
        self.envelopes.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn publish_audio_frame(&self, _frame: Vec<u8>) -> Result<(), ProtocolError> {
        self.audio_frames.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Polls `check` until it returns true.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

// ── wiring ──

pub struct Setup {
    pub config: AgentConfig,
    pub llm: Arc<ScriptedLlm>,
    pub store: Arc<MemoryStore>,
    pub tts: Option<Arc<dyn TtsPort>>,
    pub asr: Option<Arc<dyn AsrPort>>,
    pub embedder: Option<Arc<dyn EmbeddingPort>>,
}

impl Setup {
    pub fn new(scripts: Vec<Vec<Step>>) -> Self {
        let mut config = AgentConfig::default();
        config.session_grace_ms = 50;
        Self {
            config,
            llm: Arc::new(ScriptedLlm::new(scripts)),
            store: Arc::new(MemoryStore::default()),
            tts: None,
            asr: None,
            embedder: None,
        }
    }

    pub fn services(&self) -> AgentServices {
        let repos = Repositories::from_store(self.store.clone());
        let memory = MemoryRetriever::new(self.embedder.clone(), repos.memories.clone());
        let mut tools = ToolRegistry::new();
        tools.register(Arc::new(Calculator));
        tools.register(Arc::new(MemoryQuery::new(
            memory.clone(),
            self.config.memory_min_score,
        )));
        tools.register(Arc::new(Remember::new(memory.clone())));
        AgentServices {
            config: Arc::new(self.config.clone()),
            llm: self.llm.clone(),
            tools: Arc::new(tools),
            memory,
            repos,
            asr: self.asr.clone(),
            tts: self.tts.clone(),
        }
    }
}

pub fn user_message(conversation_id: &str, stanza_id: i32, id: &str, content: &str) -> Envelope {
    Envelope::new(
        conversation_id,
        Body::UserMessage(UserMessage {
            id: id.to_string(),
            previous_id: None,
            conversation_id: conversation_id.to_string(),
            content: content.to_string(),
            timestamp: None,
        }),
    )
    .with_stanza_id(stanza_id)
}

pub fn sentences(bodies: &[Body]) -> Vec<(i32, String, bool)> {
    bodies
        .iter()
        .filter_map(|b| match b {
            Body::AssistantSentence(s) => Some((s.sequence, s.text.clone(), s.is_final)),
            _ => None,
        })
        .collect()
}

pub fn assistant_message(store: &MemoryStore, conversation_id: &str) -> Message {
    store
        .messages(conversation_id)
        .into_iter()
        .rev()
        .find(|m| m.role == Role::Assistant)
        .expect("no assistant message stored")
}
