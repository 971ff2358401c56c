use crate::error::VoiceError;
use crate::ports::{AsrPort, AudioFormat};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Maximum audio input size (10 MiB). Prevents OOM from oversized payloads.
const MAX_ASR_INPUT_BYTES: usize = 10 * 1024 * 1024;

/// Recognizer backed by a whisper.cpp binary reading WAV from stdin.
#[derive(Debug, Clone)]
pub struct WhisperAsr {
    model_path: PathBuf,
    binary_path: PathBuf,
    language: Option<String>,
    timeout: Duration,
}

impl WhisperAsr {
    pub fn new(model_path: impl Into<PathBuf>, binary_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            binary_path: binary_path.into(),
            language: None,
            timeout: Duration::from_secs(10),
        }
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl AsrPort for WhisperAsr {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<String, VoiceError> {
        if audio.len() > MAX_ASR_INPUT_BYTES {
            return Err(VoiceError::Asr(format!(
                "audio data exceeds maximum size: {} bytes (limit: {} bytes)",
                audio.len(),
                MAX_ASR_INPUT_BYTES
            )));
        }

        let wav;
        let input = match format {
            AudioFormat::Wav { .. } => audio,
            AudioFormat::Pcm16 {
                sample_rate,
                channels,
            } => {
                wav = crate::audio::prepare_for_asr(audio, sample_rate, channels)?;
                &wav[..]
            }
        };

        // -m <model>  -f - (stdin)  -nt (no timestamps in the transcript)
        let mut command = Command::new(&self.binary_path);
        command
            .arg("-m")
            .arg(&self.model_path)
            .arg("-f")
            .arg("-")
            .arg("-nt");
        if let Some(language) = &self.language {
            command.arg("-l").arg(language);
        }
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| VoiceError::Asr(format!("Failed to spawn ASR binary: {}", e)))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| VoiceError::Asr("Failed to open stdin".to_string()))?;
        let input = input.to_vec();
        let write_task = tokio::spawn(async move { stdin.write_all(&input).await });

        let output = tokio::time::timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| VoiceError::timeout("speech recognition", self.timeout))?
            .map_err(|e| VoiceError::Asr(format!("Failed to read stdout: {}", e)))?;

        match write_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(VoiceError::Asr(format!("Failed to write to stdin: {}", e)))
            }
            Err(e) => return Err(VoiceError::Asr(format!("Stdin task failed: {}", e))),
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(VoiceError::Asr(format!("ASR binary failed: {}", stderr)));
        }

        let text = String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(text)
    }
}
