//! Speech service seams used by the ingestion pipeline and the synthesizer.

use crate::error::VoiceError;
use async_trait::async_trait;

/// Container of audio handed to a recognizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioFormat {
    /// WAV with a PCM16 payload.
    Wav { sample_rate: u32, channels: u16 },
    /// Headerless PCM16.
    Pcm16 { sample_rate: u32, channels: u16 },
}

/// Speech-to-text.
#[async_trait]
pub trait AsrPort: Send + Sync {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<String, VoiceError>;
}

/// Mono PCM16 produced by a synthesizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedAudio {
    pub pcm: Vec<u8>,
    pub sample_rate: u32,
}

/// Text-to-speech. `voice` of `None` selects the engine default.
#[async_trait]
pub trait TtsPort: Send + Sync {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
    ) -> Result<SynthesizedAudio, VoiceError>;
}
