//! Server configuration loading from file and environment variables.

use cadence_agent::AgentConfig;
use cadence_voice::LiveKitConfig;
use serde::Deserialize;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use thiserror::Error;

/// Top-level server configuration. Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    /// Without it memory retrieval is disabled.
    #[serde(default)]
    pub embedding: Option<EmbeddingConfig>,

    /// Without it sessions are text only.
    #[serde(default)]
    pub speech: Option<SpeechConfig>,

    /// Without it no rooms are created and join tokens are unavailable.
    #[serde(default)]
    pub livekit: Option<LiveKitConfig>,

    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "cadence_agent=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// An OpenAI-compatible chat completions endpoint.
#[derive(Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// An OpenAI-compatible embeddings endpoint.
#[derive(Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,
}

/// Local speech binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct SpeechConfig {
    #[serde(default = "default_whisper_binary")]
    pub whisper_binary: String,

    /// Recognition is disabled when unset.
    #[serde(default)]
    pub whisper_model: Option<String>,

    #[serde(default)]
    pub language: Option<String>,

    #[serde(default = "default_piper_binary")]
    pub piper_binary: String,

    /// Directory of `<voice>.onnx` models. Synthesis is disabled when unset.
    #[serde(default)]
    pub voices_dir: Option<String>,

    #[serde(default = "default_voice")]
    pub default_voice: String,

    #[serde(default = "default_tts_sample_rate")]
    pub tts_sample_rate: u32,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "cadence.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_llm_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_llm_model() -> String {
    "llama3.1".to_string()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_whisper_binary() -> String {
    "whisper-cli".to_string()
}

fn default_piper_binary() -> String {
    "piper".to_string()
}

fn default_voice() -> String {
    "en_US-lessac-medium".to_string()
}

fn default_tts_sample_rate() -> u32 {
    22_050
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: String::new(),
            model: default_llm_model(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl fmt::Debug for LlmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl fmt::Debug for EmbeddingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"[REDACTED]")
            .field("model", &self.model)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Loads configuration from a TOML file, falling back to defaults when the
/// file does not exist.
///
/// Environment variable overrides:
/// - `CADENCE_HOST`, `CADENCE_PORT`
/// - `CADENCE_DB_PATH`
/// - `CADENCE_LOG_LEVEL`, `CADENCE_LOG_JSON` ("true" or "1")
/// - `CADENCE_LLM_BASE_URL`, `CADENCE_LLM_API_KEY`, `CADENCE_LLM_MODEL`
/// - `CADENCE_LIVEKIT_URL`, `CADENCE_LIVEKIT_API_KEY`,
///   `CADENCE_LIVEKIT_API_SECRET`
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

fn apply_env_overrides(config: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(host) = var("CADENCE_HOST").and_then(|v| v.parse().ok()) {
        config.server.host = host;
    }
    if let Some(port) = var("CADENCE_PORT").and_then(|v| v.parse().ok()) {
        config.server.port = port;
    }
    if let Some(db_path) = var("CADENCE_DB_PATH") {
        config.database.path = db_path;
    }
    if let Some(level) = var("CADENCE_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Some(json) = var("CADENCE_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Some(base_url) = var("CADENCE_LLM_BASE_URL") {
        config.llm.base_url = base_url;
    }
    if let Some(api_key) = var("CADENCE_LLM_API_KEY") {
        config.llm.api_key = api_key;
    }
    if let Some(model) = var("CADENCE_LLM_MODEL") {
        config.llm.model = model;
    }

    let livekit_url = var("CADENCE_LIVEKIT_URL");
    let livekit_key = var("CADENCE_LIVEKIT_API_KEY");
    let livekit_secret = var("CADENCE_LIVEKIT_API_SECRET");
    if livekit_url.is_some() || livekit_key.is_some() || livekit_secret.is_some() {
        let livekit = config.livekit.get_or_insert_with(LiveKitConfig::default);
        if let Some(url) = livekit_url {
            livekit.url = url;
        }
        if let Some(key) = livekit_key {
            livekit.api_key = key;
        }
        if let Some(secret) = livekit_secret {
            livekit.api_secret = secret;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(Some(path.to_str().unwrap())).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.database.path, "cadence.db");
        assert!(config.embedding.is_none());
        assert!(config.livekit.is_none());
        assert_eq!(config.agent.history_limit, 20);
    }

    #[test]
    fn file_sections_are_parsed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
port = 4100

[llm]
base_url = "https://api.example.com"
api_key = "sk-secret"
model = "gpt-4o-mini"

[embedding]
model = "text-embedding-3-small"

[speech]
voices_dir = "/opt/voices"

[agent]
memory_top_k = 3
session_grace_ms = 5000
"#
        )
        .unwrap();

        let config = load_config(Some(file.path().to_str().unwrap())).unwrap();
        assert_eq!(config.server.port, 4100);
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.embedding.unwrap().model, "text-embedding-3-small");
        let speech = config.speech.unwrap();
        assert_eq!(speech.voices_dir.as_deref(), Some("/opt/voices"));
        assert_eq!(speech.piper_binary, "piper");
        assert!(speech.whisper_model.is_none());
        assert_eq!(config.agent.memory_top_k, 3);
        assert_eq!(config.agent.memory_min_score, 0.7);
        assert_eq!(config.agent.session_grace_ms, 5000);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server\nport = ").unwrap();
        assert!(matches!(
            load_config(Some(file.path().to_str().unwrap())),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn environment_overrides_file_values() {
        let vars: HashMap<&str, &str> = [
            ("CADENCE_PORT", "5000"),
            ("CADENCE_HOST", "not-an-ip"),
            ("CADENCE_LOG_JSON", "1"),
            ("CADENCE_LLM_MODEL", "mistral"),
            ("CADENCE_LIVEKIT_URL", "wss://rooms.example.com"),
            ("CADENCE_LIVEKIT_API_KEY", "key"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.host, default_host());
        assert!(config.logging.json);
        assert_eq!(config.llm.model, "mistral");
        let livekit = config.livekit.unwrap();
        assert!(livekit.is_enabled());
        assert_eq!(livekit.token_ttl_seconds, 3600);
    }

    #[test]
    fn debug_output_redacts_keys() {
        let llm = LlmConfig {
            api_key: "sk-very-secret".to_string(),
            ..LlmConfig::default()
        };
        let rendered = format!("{:?}", llm);
        assert!(!rendered.contains("sk-very-secret"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
