//! Voice-activity-triggered transcription of inbound audio.
//!
//! [`VoiceIngestion`] is the per-session state machine
//! (`Idle → Buffering → Flushing → Idle`). It is pure: the caller owns the
//! silence timer and the recognizer call. [`run_ingestion`] wires it to a
//! frame channel, a tokio timer and an [`AsrPort`].

use crate::audio::{downmix, pcm16_duration, prepare_for_asr, rms_pcm16, ASR_SAMPLE_RATE};
use crate::config::VadConfig;
use crate::ports::{AsrPort, AudioFormat};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    /// Waiting for speech. Silent frames are not buffered.
    Idle,
    /// Speech seen; every frame is appended.
    Buffering,
    /// An utterance was handed off and is being transcribed.
    Flushing,
}

/// What the caller should do with the silence timer after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SilenceTimer {
    Start,
    Cancel,
    Unchanged,
}

/// Buffered speech ready for recognition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Utterance {
    /// Interleaved PCM16 at the capture rate.
    pub pcm: Vec<u8>,
    pub duration: Duration,
    /// Set when the buffer cap forced the flush.
    pub forced: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame was silence outside an utterance, or arrived mid-flush.
    Ignored,
    Buffered(SilenceTimer),
    /// The buffer reached its cap and must be transcribed now.
    Flush(Utterance),
}

pub struct VoiceIngestion {
    config: VadConfig,
    state: IngestionState,
    buffer: Vec<u8>,
    speech: Duration,
    timer_armed: bool,
}

impl VoiceIngestion {
    pub fn new(config: VadConfig) -> Self {
        Self {
            config,
            state: IngestionState::Idle,
            buffer: Vec::new(),
            speech: Duration::ZERO,
            timer_armed: false,
        }
    }

    pub fn state(&self) -> IngestionState {
        self.state
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }

    /// Duration of audio currently buffered.
    pub fn buffered(&self) -> Duration {
        pcm16_duration(
            self.buffer.len(),
            self.config.sample_rate,
            self.config.channels,
        )
    }

    /// Feeds one interleaved PCM16 frame.
    pub fn push_frame(&mut self, frame: &[u8]) -> FrameOutcome {
        if self.state == IngestionState::Flushing || frame.is_empty() {
            return FrameOutcome::Ignored;
        }

        let rms = rms_pcm16(&downmix(frame, self.config.channels));
        let is_speech = rms >= self.config.silence_threshold;

        if self.state == IngestionState::Idle {
            if !is_speech {
                return FrameOutcome::Ignored;
            }
            self.state = IngestionState::Buffering;
        }

        self.buffer.extend_from_slice(frame);
        let frame_duration =
            pcm16_duration(frame.len(), self.config.sample_rate, self.config.channels);

        let timer = if is_speech {
            self.speech += frame_duration;
            if self.timer_armed {
                self.timer_armed = false;
                SilenceTimer::Cancel
            } else {
                SilenceTimer::Unchanged
            }
        } else if !self.timer_armed {
            self.timer_armed = true;
            SilenceTimer::Start
        } else {
            SilenceTimer::Unchanged
        };

        if self.buffered() >= self.config.max_buffer() {
            return FrameOutcome::Flush(self.take(true));
        }
        FrameOutcome::Buffered(timer)
    }

    /// Handles expiry of the silence timer.
    ///
    /// Returns the utterance to transcribe, or `None` when the buffered
    /// speech was shorter than the minimum and has been discarded as noise.
    pub fn on_silence_timeout(&mut self) -> Option<Utterance> {
        self.timer_armed = false;
        if self.state != IngestionState::Buffering {
            return None;
        }
        if self.speech < self.config.min_speech() {
            tracing::debug!(
                speech_ms = self.speech.as_millis() as u64,
                "discarding short audio burst"
            );
            self.reset();
            return None;
        }
        Some(self.take(false))
    }

    /// Returns to `Idle` once the flushed utterance has been handled.
    pub fn finish_flush(&mut self) {
        if self.state == IngestionState::Flushing {
            self.state = IngestionState::Idle;
        }
    }

    fn take(&mut self, forced: bool) -> Utterance {
        let duration = self.buffered();
        let pcm = std::mem::take(&mut self.buffer);
        self.speech = Duration::ZERO;
        self.timer_armed = false;
        self.state = IngestionState::Flushing;
        Utterance {
            pcm,
            duration,
            forced,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.speech = Duration::ZERO;
        self.timer_armed = false;
        self.state = IngestionState::Idle;
    }
}

/// Result of one recognizer round-trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionEvent {
    pub text: String,
    pub is_final: bool,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Drives a [`VoiceIngestion`] until `frames` closes or `cancel` fires.
///
/// Recognizer failures and timeouts produce a non-final event with an empty
/// text and keep listening. Successful but empty transcripts are dropped.
pub async fn run_ingestion(
    mut ingestion: VoiceIngestion,
    asr: Arc<dyn AsrPort>,
    asr_timeout: Duration,
    mut frames: mpsc::Receiver<Vec<u8>>,
    events: mpsc::Sender<TranscriptionEvent>,
    cancel: CancellationToken,
) {
    let silence_timeout = ingestion.config().silence_timeout();
    let mut deadline: Option<Instant> = None;

    loop {
        let utterance = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => {
                let Some(frame) = frame else { break };
                match ingestion.push_frame(&frame) {
                    FrameOutcome::Ignored => None,
                    FrameOutcome::Buffered(SilenceTimer::Start) => {
                        deadline = Some(Instant::now() + silence_timeout);
                        None
                    }
                    FrameOutcome::Buffered(SilenceTimer::Cancel) => {
                        deadline = None;
                        None
                    }
                    FrameOutcome::Buffered(SilenceTimer::Unchanged) => None,
                    FrameOutcome::Flush(utterance) => {
                        deadline = None;
                        Some(utterance)
                    }
                }
            }
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                ingestion.on_silence_timeout()
            }
        };

        let Some(utterance) = utterance else { continue };

        let config = ingestion.config().clone();
        tracing::info!(
            duration_ms = utterance.duration.as_millis() as u64,
            forced = utterance.forced,
            "transcribing buffered audio"
        );

        let format = AudioFormat::Wav {
            sample_rate: ASR_SAMPLE_RATE,
            channels: 1,
        };
        let result = match prepare_for_asr(&utterance.pcm, config.sample_rate, config.channels) {
            Ok(wav) => tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout(asr_timeout, asr.transcribe(&wav, format)) => r,
            },
            Err(e) => Ok(Err(e)),
        };
        ingestion.finish_flush();

        let event = match result {
            Ok(Ok(text)) if text.trim().is_empty() => {
                tracing::debug!("empty transcription result");
                continue;
            }
            Ok(Ok(text)) => TranscriptionEvent {
                text: text.trim().to_string(),
                is_final: true,
                error: None,
                duration: utterance.duration,
            },
            Ok(Err(e)) => {
                tracing::warn!("speech recognition failed: {}", e);
                TranscriptionEvent {
                    text: String::new(),
                    is_final: false,
                    error: Some(e.to_string()),
                    duration: utterance.duration,
                }
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = asr_timeout.as_millis() as u64,
                    "speech recognition timed out"
                );
                TranscriptionEvent {
                    text: String::new(),
                    is_final: false,
                    error: Some(format!(
                        "speech recognition timed out after {:.1}s",
                        asr_timeout.as_secs_f64()
                    )),
                    duration: utterance.duration,
                }
            }
        };

        if events.send(event).await.is_err() {
            break;
        }
    }
    tracing::debug!("voice ingestion stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> VadConfig {
        VadConfig {
            sample_rate: 1_000,
            channels: 1,
            ..Default::default()
        }
    }

    /// 100 ms mono frame at 1 kHz with constant amplitude.
    fn frame(amplitude: i16) -> Vec<u8> {
        std::iter::repeat(amplitude)
            .take(100)
            .flat_map(i16::to_le_bytes)
            .collect()
    }

    #[test]
    fn silence_while_idle_is_ignored() {
        let mut vad = VoiceIngestion::new(config());
        assert_eq!(vad.push_frame(&frame(10)), FrameOutcome::Ignored);
        assert_eq!(vad.state(), IngestionState::Idle);
        assert_eq!(vad.buffered(), Duration::ZERO);
    }

    #[test]
    fn speech_then_silence_arms_timer_once() {
        let mut vad = VoiceIngestion::new(config());
        assert_eq!(
            vad.push_frame(&frame(2000)),
            FrameOutcome::Buffered(SilenceTimer::Unchanged)
        );
        assert_eq!(vad.state(), IngestionState::Buffering);
        assert_eq!(
            vad.push_frame(&frame(0)),
            FrameOutcome::Buffered(SilenceTimer::Start)
        );
        assert_eq!(
            vad.push_frame(&frame(0)),
            FrameOutcome::Buffered(SilenceTimer::Unchanged)
        );
        assert_eq!(
            vad.push_frame(&frame(2000)),
            FrameOutcome::Buffered(SilenceTimer::Cancel)
        );
    }

    #[test]
    fn short_burst_is_discarded() {
        let mut vad = VoiceIngestion::new(config());
        vad.push_frame(&frame(2000));
        vad.push_frame(&frame(2000));
        vad.push_frame(&frame(0));
        assert_eq!(vad.on_silence_timeout(), None);
        assert_eq!(vad.state(), IngestionState::Idle);
        assert_eq!(vad.buffered(), Duration::ZERO);
    }

    #[test]
    fn long_enough_speech_is_flushed() {
        let mut vad = VoiceIngestion::new(config());
        for _ in 0..3 {
            vad.push_frame(&frame(2000));
        }
        vad.push_frame(&frame(0));
        let utterance = vad.on_silence_timeout().expect("utterance");
        assert_eq!(utterance.duration, Duration::from_millis(400));
        assert!(!utterance.forced);
        assert_eq!(vad.state(), IngestionState::Flushing);

        assert_eq!(vad.push_frame(&frame(2000)), FrameOutcome::Ignored);
        vad.finish_flush();
        assert_eq!(vad.state(), IngestionState::Idle);
    }

    #[test]
    fn buffer_cap_forces_flush() {
        let mut vad = VoiceIngestion::new(VadConfig {
            max_buffer_ms: 500,
            ..config()
        });
        for _ in 0..4 {
            assert!(matches!(
                vad.push_frame(&frame(2000)),
                FrameOutcome::Buffered(_)
            ));
        }
        match vad.push_frame(&frame(2000)) {
            FrameOutcome::Flush(u) => {
                assert!(u.forced);
                assert_eq!(u.duration, Duration::from_millis(500));
            }
            other => panic!("expected flush, got {:?}", other),
        }
    }
}
