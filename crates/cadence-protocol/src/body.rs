//! Message types and their typed payloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Numeric message type carried in the envelope `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    ErrorMessage = 1,
    UserMessage = 2,
    AssistantMessage = 3,
    AudioChunk = 4,
    ReasoningStep = 5,
    ToolUseRequest = 6,
    ToolUseResult = 7,
    Acknowledgement = 8,
    Transcription = 9,
    ControlStop = 10,
    ControlVariation = 11,
    Configuration = 12,
    StartAnswer = 13,
    MemoryTrace = 14,
    Commentary = 15,
    AssistantSentence = 16,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        Self::ErrorMessage,
        Self::UserMessage,
        Self::AssistantMessage,
        Self::AudioChunk,
        Self::ReasoningStep,
        Self::ToolUseRequest,
        Self::ToolUseResult,
        Self::Acknowledgement,
        Self::Transcription,
        Self::ControlStop,
        Self::ControlVariation,
        Self::Configuration,
        Self::StartAnswer,
        Self::MemoryTrace,
        Self::Commentary,
        Self::AssistantSentence,
    ];

    /// Maps a wire id to a known type. Unknown ids return `None`.
    pub fn from_u16(id: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.as_u16() == id)
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::ErrorMessage => "ErrorMessage",
            Self::UserMessage => "UserMessage",
            Self::AssistantMessage => "AssistantMessage",
            Self::AudioChunk => "AudioChunk",
            Self::ReasoningStep => "ReasoningStep",
            Self::ToolUseRequest => "ToolUseRequest",
            Self::ToolUseResult => "ToolUseResult",
            Self::Acknowledgement => "Acknowledgement",
            Self::Transcription => "Transcription",
            Self::ControlStop => "ControlStop",
            Self::ControlVariation => "ControlVariation",
            Self::Configuration => "Configuration",
            Self::StartAnswer => "StartAnswer",
            Self::MemoryTrace => "MemoryTrace",
            Self::Commentary => "Commentary",
            Self::AssistantSentence => "AssistantSentence",
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Numeric codes carried by [`ErrorMessage::code`].
pub mod error_codes {
    pub const MALFORMED_DATA: i32 = 101;
    pub const UNKNOWN_TYPE: i32 = 102;
    pub const CONVERSATION_NOT_FOUND: i32 = 201;
    pub const INVALID_STATE: i32 = 202;
    /// The client asked for a replay older than the server still buffers.
    pub const HISTORY_GAP: i32 = 203;
    pub const UNSUPPORTED_VARIATION: i32 = 204;
    pub const TOOL_NOT_FOUND: i32 = 301;
    pub const TOOL_TIMEOUT: i32 = 304;
    pub const INTERNAL_ERROR: i32 = 501;
    pub const SERVICE_UNAVAILABLE: i32 = 503;
    pub const QUEUE_OVERFLOW: i32 = 504;
}

fn is_false(b: &bool) -> bool {
    !*b
}

fn is_zero(n: &i32) -> bool {
    *n == 0
}

/// Severity of an [`ErrorMessage`], encoded as an integer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
pub enum Severity {
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

impl From<Severity> for i32 {
    fn from(s: Severity) -> i32 {
        match s {
            Severity::Info => 0,
            Severity::Warning => 1,
            Severity::Error => 2,
            Severity::Critical => 3,
        }
    }
}

impl TryFrom<i32> for Severity {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, String> {
        match v {
            0 => Ok(Severity::Info),
            1 => Ok(Severity::Warning),
            2 => Ok(Severity::Error),
            3 => Ok(Severity::Critical),
            other => Err(format!("unknown severity {}", other)),
        }
    }
}

/// What a [`ControlStop`] halts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopType {
    /// Stop producing text; audio already queued for the message is dropped too.
    Generation,
    /// Stop audio synthesis and playback only. Text keeps streaming.
    Speech,
    #[default]
    All,
}

/// Where a tool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolExecution {
    #[default]
    Server,
    Client,
    Either,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnswerType {
    #[serde(rename = "text")]
    Text,
    #[serde(rename = "voice")]
    Voice,
    #[serde(rename = "text+voice")]
    TextVoice,
}

/// Kind of regeneration requested by a [`ControlVariation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariationMode {
    Regenerate,
    Edit,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorMessage {
    pub id: String,
    pub conversation_id: String,
    pub code: i32,
    pub message: String,
    pub severity: Severity,
    /// Set when retrying the failed operation may succeed.
    pub recoverable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub originating_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub conversation_id: String,
    /// MIME-like format tag, e.g. `audio/pcm;rate=48000;channels=2`.
    pub format: String,
    pub sequence: i32,
    pub duration_ms: i32,
    #[serde(default, with = "serde_bytes")]
    pub data: Vec<u8>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_last: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReasoningStep {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub sequence: i32,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseRequest {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub tool_name: String,
    pub parameters: Value,
    #[serde(default)]
    pub execution: ToolExecution,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub timeout_ms: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolUseResult {
    pub id: String,
    pub request_id: String,
    pub conversation_id: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    pub conversation_id: String,
    pub acknowledged_stanza_id: i32,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcription {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_id: Option<String>,
    pub conversation_id: String,
    pub text: String,
    #[serde(rename = "final")]
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Present when the recognizer failed; `text` is then empty.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlStop {
    pub conversation_id: String,
    /// Message to stop. Empty means whatever is currently generating.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub stop_type: StopType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlVariation {
    pub conversation_id: String,
    pub target_id: String,
    pub mode: VariationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Configuration {
    #[serde(default)]
    pub conversation_id: String,
    /// Highest server stanza id the client has processed.
    #[serde(default)]
    pub last_sequence_seen: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub features: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartAnswer {
    pub id: String,
    pub previous_id: String,
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer_type: Option<AnswerType>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub planned_sentence_count: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryTrace {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub memory_id: String,
    pub content: String,
    pub relevance: f32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commentary {
    pub id: String,
    pub message_id: String,
    pub conversation_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commentary_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSentence {
    #[serde(default)]
    pub id: String,
    /// Id of the assistant message opened by [`StartAnswer`].
    pub previous_id: String,
    pub conversation_id: String,
    pub sequence: i32,
    pub text: String,
    #[serde(default, skip_serializing_if = "is_false")]
    pub is_final: bool,
    #[serde(
        default,
        with = "serde_bytes",
        skip_serializing_if = "Option::is_none"
    )]
    pub audio: Option<Vec<u8>>,
}

/// Typed envelope payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Body {
    Error(ErrorMessage),
    UserMessage(UserMessage),
    AssistantMessage(AssistantMessage),
    AudioChunk(AudioChunk),
    ReasoningStep(ReasoningStep),
    ToolUseRequest(ToolUseRequest),
    ToolUseResult(ToolUseResult),
    Acknowledgement(Acknowledgement),
    Transcription(Transcription),
    ControlStop(ControlStop),
    ControlVariation(ControlVariation),
    Configuration(Configuration),
    StartAnswer(StartAnswer),
    MemoryTrace(MemoryTrace),
    Commentary(Commentary),
    AssistantSentence(AssistantSentence),
    /// A type id this build does not know. The raw body is kept verbatim.
    Unknown { type_id: u16, raw: Vec<u8> },
}

impl Body {
    /// Known type of this body, or `None` for [`Body::Unknown`].
    pub fn message_type(&self) -> Option<MessageType> {
        Some(match self {
            Body::Error(_) => MessageType::ErrorMessage,
            Body::UserMessage(_) => MessageType::UserMessage,
            Body::AssistantMessage(_) => MessageType::AssistantMessage,
            Body::AudioChunk(_) => MessageType::AudioChunk,
            Body::ReasoningStep(_) => MessageType::ReasoningStep,
            Body::ToolUseRequest(_) => MessageType::ToolUseRequest,
            Body::ToolUseResult(_) => MessageType::ToolUseResult,
            Body::Acknowledgement(_) => MessageType::Acknowledgement,
            Body::Transcription(_) => MessageType::Transcription,
            Body::ControlStop(_) => MessageType::ControlStop,
            Body::ControlVariation(_) => MessageType::ControlVariation,
            Body::Configuration(_) => MessageType::Configuration,
            Body::StartAnswer(_) => MessageType::StartAnswer,
            Body::MemoryTrace(_) => MessageType::MemoryTrace,
            Body::Commentary(_) => MessageType::Commentary,
            Body::AssistantSentence(_) => MessageType::AssistantSentence,
            Body::Unknown { .. } => return None,
        })
    }

    /// Wire type id, including ids of unknown bodies.
    pub fn type_id(&self) -> u16 {
        match self {
            Body::Unknown { type_id, .. } => *type_id,
            other => other.message_type().map(MessageType::as_u16).unwrap_or_default(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.message_type().map(MessageType::name).unwrap_or("Unknown")
    }
}
