use cadence_protocol::DeliveryConfig;
use cadence_voice::{OutputFormat, VadConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_SYSTEM_PROMPT: &str =
    "You are Cadence, a helpful voice assistant. Answer in short, natural spoken sentences.";

const DEFAULT_ABBREVIATIONS: &[&str] = &[
    "dr", "mr", "mrs", "ms", "etc", "e.g", "i.e", "inc", "ltd", "co", "vs", "st", "jr", "sr",
    "prof",
];

/// Outbound delivery tracking, in wire-friendly units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    pub capacity: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let d = DeliveryConfig::default();
        Self {
            capacity: d.capacity,
            base_delay_ms: d.base_delay.as_millis() as u64,
            max_delay_ms: d.max_delay.as_millis() as u64,
            max_attempts: d.max_attempts,
        }
    }
}

impl DeliverySettings {
    pub fn to_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            capacity: self.capacity,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Orchestration parameters. Every field has a default, so a partial
/// `[agent]` table is enough.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub system_prompt: String,
    /// Memories retrieved per turn.
    pub memory_top_k: usize,
    /// Minimum cosine similarity for a memory to be used.
    pub memory_min_score: f32,
    /// Persisted messages included in the model context.
    pub history_limit: usize,
    /// Unpunctuated text longer than this is cut at the last whitespace.
    pub max_sentence_chars: usize,
    /// Lowercase words whose trailing period does not end a sentence.
    pub abbreviations: Vec<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Longest wait between two stream deltas.
    pub llm_idle_timeout_ms: u64,
    pub tool_timeout_ms: u64,
    pub tts_timeout_ms: u64,
    pub asr_timeout_ms: u64,
    pub tts_workers: usize,
    /// Sentences of one answer that may wait for speech at once. Sentence
    /// emission pauses while the window is full.
    pub speech_window: usize,
    /// How long a session outlives its client connection.
    pub session_grace_ms: u64,
    pub delivery: DeliverySettings,
    pub vad: VadConfig,
    pub output: OutputFormat,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            memory_top_k: 5,
            memory_min_score: 0.7,
            history_limit: 20,
            max_sentence_chars: 400,
            abbreviations: DEFAULT_ABBREVIATIONS.iter().map(|s| s.to_string()).collect(),
            temperature: None,
            max_tokens: None,
            llm_idle_timeout_ms: 30_000,
            tool_timeout_ms: 30_000,
            tts_timeout_ms: 10_000,
            asr_timeout_ms: 10_000,
            tts_workers: 4,
            speech_window: 8,
            session_grace_ms: 30_000,
            delivery: DeliverySettings::default(),
            vad: VadConfig::default(),
            output: OutputFormat::default(),
        }
    }
}

impl AgentConfig {
    pub fn llm_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.llm_idle_timeout_ms)
    }

    pub fn tool_timeout(&self) -> Duration {
        Duration::from_millis(self.tool_timeout_ms)
    }

    pub fn tts_timeout(&self) -> Duration {
        Duration::from_millis(self.tts_timeout_ms)
    }

    pub fn asr_timeout(&self) -> Duration {
        Duration::from_millis(self.asr_timeout_ms)
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_millis(self.session_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.memory_top_k, 5);
        assert_eq!(cfg.memory_min_score, 0.7);
        assert_eq!(cfg.history_limit, 20);
        assert_eq!(cfg.llm_idle_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.tool_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.tts_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.asr_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.tts_workers, 4);
        assert_eq!(cfg.speech_window, 8);
        assert!(cfg.abbreviations.iter().any(|a| a == "dr"));

        let delivery = cfg.delivery.to_config();
        assert_eq!(delivery.capacity, 256);
        assert_eq!(delivery.base_delay, Duration::from_millis(500));
        assert_eq!(delivery.max_delay, Duration::from_secs(4));
        assert_eq!(delivery.max_attempts, 5);
    }

    #[test]
    fn partial_table_keeps_defaults() {
        let cfg: AgentConfig = toml::from_str(
            r#"
            memory_top_k = 3
            abbreviations = ["dr", "approx"]

            [vad]
            min_speech_ms = 500

            [delivery]
            capacity = 16
            "#,
        )
        .unwrap();
        assert_eq!(cfg.memory_top_k, 3);
        assert_eq!(cfg.abbreviations, vec!["dr", "approx"]);
        assert_eq!(cfg.vad.min_speech_ms, 500);
        assert_eq!(cfg.vad.silence_timeout_ms, 1500);
        assert_eq!(cfg.delivery.capacity, 16);
        assert_eq!(cfg.delivery.max_attempts, 5);
        assert_eq!(cfg.history_limit, 20);
    }
}
