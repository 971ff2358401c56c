use crate::audio::strip_wav_header;
use crate::error::VoiceError;
use crate::ports::{SynthesizedAudio, TtsPort};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum text input size (64 KiB). Prevents resource exhaustion from
/// oversized synthesis requests.
const MAX_TTS_INPUT_BYTES: usize = 64 * 1024;

/// Synthesizer backed by the piper binary writing raw PCM to stdout.
///
/// A voice name `v` resolves to the model `<voices_dir>/v.onnx`.
#[derive(Debug, Clone)]
pub struct PiperTts {
    voices_dir: PathBuf,
    piper_binary: PathBuf,
    default_voice: String,
    sample_rate: u32,
    timeout: Duration,
}

impl PiperTts {
    pub fn new(
        voices_dir: impl AsRef<Path>,
        piper_binary: impl AsRef<Path>,
        default_voice: impl Into<String>,
        sample_rate: u32,
    ) -> Self {
        Self {
            voices_dir: voices_dir.as_ref().to_path_buf(),
            piper_binary: piper_binary.as_ref().to_path_buf(),
            default_voice: default_voice.into(),
            sample_rate,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Resolves a voice name to its model file.
    pub fn model_path(&self, voice: Option<&str>) -> Result<PathBuf, VoiceError> {
        let voice = voice.unwrap_or(&self.default_voice);
        if voice.is_empty() || voice.contains(|c: char| c == '/' || c == '\\') || voice.contains("..") {
            return Err(VoiceError::Config(format!("invalid voice name: {:?}", voice)));
        }
        let path = self.voices_dir.join(format!("{}.onnx", voice));
        if !path.exists() {
            return Err(VoiceError::Tts(format!("Model file not found: {:?}", path)));
        }
        Ok(path)
    }
}

#[async_trait]
impl TtsPort for PiperTts {
    async fn synthesize(
        &self,
        text: &str,
        voice: Option<&str>,
    ) -> Result<SynthesizedAudio, VoiceError> {
        if text.len() > MAX_TTS_INPUT_BYTES {
            return Err(VoiceError::Tts(format!(
                "text exceeds maximum size: {} bytes (limit: {} bytes)",
                text.len(),
                MAX_TTS_INPUT_BYTES
            )));
        }
        let model_path = self.model_path(voice)?;

        let mut command = Command::new(&self.piper_binary);
        command
            .arg("--model")
            .arg(model_path)
            .arg("--output_raw")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Tts(format!("Failed to spawn piper: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Tts("Failed to open stdin".to_string()))?;
        let text_owned = text.to_string();

        // Write from a separate task so a full stdout pipe cannot deadlock us.
        let write_task = tokio::spawn(async move { stdin.write_all(text_owned.as_bytes()).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VoiceError::timeout("speech synthesis", self.timeout))?
            .map_err(|e| VoiceError::Tts(format!("Failed to wait for piper: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Tts(format!(
                    "Failed to write to piper stdin: {}",
                    e
                )))
            }
            Err(e) => return Err(VoiceError::Tts(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Tts(format!("Piper failed: {}", stderr)));
        }

        Ok(SynthesizedAudio {
            pcm: strip_wav_header(&output.stdout).to_vec(),
            sample_rate: self.sample_rate,
        })
    }
}
