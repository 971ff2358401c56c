use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

fn default_token_ttl_seconds() -> u64 {
    3600
}

#[derive(Clone, Serialize, Deserialize)]
pub struct LiveKitConfig {
    pub url: String,
    pub api_key: String,
    #[serde(skip_serializing)]
    pub api_secret: String,
    /// Lifetime of client join tokens. Default: 3600 (1 hour).
    #[serde(default = "default_token_ttl_seconds")]
    pub token_ttl_seconds: u64,
}

impl Default for LiveKitConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            api_secret: String::new(),
            token_ttl_seconds: default_token_ttl_seconds(),
        }
    }
}

impl fmt::Debug for LiveKitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitConfig")
            .field("url", &self.url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"[REDACTED]")
            .field("token_ttl_seconds", &self.token_ttl_seconds)
            .finish()
    }
}

impl LiveKitConfig {
    pub fn is_enabled(&self) -> bool {
        !self.url.is_empty() && !self.api_key.is_empty()
    }
}

/// Voice activity detection parameters for inbound audio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// RMS on the PCM16 scale below which a frame counts as silence.
    pub silence_threshold: f64,
    pub silence_timeout_ms: u64,
    pub min_speech_ms: u64,
    /// Buffered audio that forces a flush even without trailing silence.
    pub max_buffer_ms: u64,
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            silence_threshold: 500.0,
            silence_timeout_ms: 1500,
            min_speech_ms: 300,
            max_buffer_ms: 30_000,
            sample_rate: 48_000,
            channels: 2,
        }
    }
}

impl VadConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn min_speech(&self) -> Duration {
        Duration::from_millis(self.min_speech_ms)
    }

    pub fn max_buffer(&self) -> Duration {
        Duration::from_millis(self.max_buffer_ms)
    }
}

/// Format of audio published to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u32,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            frame_ms: 20,
        }
    }
}
