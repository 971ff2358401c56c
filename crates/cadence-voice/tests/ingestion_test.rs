use async_trait::async_trait;
use cadence_voice::{
    run_ingestion, AsrPort, AudioFormat, TranscriptionEvent, VadConfig, VoiceError,
    VoiceIngestion,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

// ── fakes ──

#[derive(Default)]
struct ScriptedAsr {
    results: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<usize>>,
    delay: Duration,
}

impl ScriptedAsr {
    fn new(results: Vec<Result<&str, &str>>) -> Self {
        Self {
            results: Mutex::new(
                results
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AsrPort for ScriptedAsr {
    async fn transcribe(&self, audio: &[u8], format: AudioFormat) -> Result<String, VoiceError> {
        assert!(matches!(
            format,
            AudioFormat::Wav {
                sample_rate: 16_000,
                channels: 1
            }
        ));
        assert_eq!(&audio[0..4], b"RIFF");
        self.calls.lock().unwrap().push(audio.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.results.lock().unwrap().pop_front() {
            Some(Ok(text)) => Ok(text),
            Some(Err(e)) => Err(VoiceError::Asr(e)),
            None => Ok(String::new()),
        }
    }
}

// ── helpers ──

const FRAME: Duration = Duration::from_millis(100);

fn config() -> VadConfig {
    VadConfig {
        sample_rate: 1_000,
        channels: 1,
        ..Default::default()
    }
}

fn frame(amplitude: i16) -> Vec<u8> {
    std::iter::repeat(amplitude)
        .take(100)
        .flat_map(i16::to_le_bytes)
        .collect()
}

struct Harness {
    frames: mpsc::Sender<Vec<u8>>,
    events: mpsc::Receiver<TranscriptionEvent>,
    cancel: CancellationToken,
}

fn start(asr: Arc<ScriptedAsr>, asr_timeout: Duration) -> Harness {
    let (frames_tx, frames_rx) = mpsc::channel(64);
    let (events_tx, events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    tokio::spawn(run_ingestion(
        VoiceIngestion::new(config()),
        asr,
        asr_timeout,
        frames_rx,
        events_tx,
        cancel.clone(),
    ));
    Harness {
        frames: frames_tx,
        events: events_rx,
        cancel,
    }
}

impl Harness {
    /// Sends `count` frames in real (paused) time.
    async fn feed(&self, amplitude: i16, count: usize) {
        for _ in 0..count {
            self.frames.send(frame(amplitude)).await.unwrap();
            tokio::time::sleep(FRAME).await;
        }
    }
}

// ── VAD behaviour ──

#[tokio::test(start_paused = true)]
async fn short_burst_produces_no_transcription() {
    let asr = Arc::new(ScriptedAsr::new(vec![Ok("noise")]));
    let mut h = start(asr.clone(), Duration::from_secs(10));

    h.feed(2000, 2).await; // 200 ms, below the 300 ms minimum
    h.feed(0, 20).await;

    assert_eq!(asr.calls(), 0);
    assert!(h.events.try_recv().is_err());
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn speech_followed_by_silence_yields_one_final_transcript() {
    let asr = Arc::new(ScriptedAsr::new(vec![Ok(" hello world ")]));
    let mut h = start(asr.clone(), Duration::from_secs(10));

    h.feed(2000, 5).await;
    h.feed(0, 10).await;
    // Timer started on the first silent frame; not yet expired.
    assert!(h.events.try_recv().is_err());
    h.feed(0, 10).await;

    let event = h.events.try_recv().expect("transcription");
    assert_eq!(event.text, "hello world");
    assert!(event.is_final);
    assert!(event.error.is_none());
    assert_eq!(asr.calls(), 1);

    h.feed(0, 30).await;
    assert!(h.events.try_recv().is_err());
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn speech_resuming_cancels_the_silence_timer() {
    let asr = Arc::new(ScriptedAsr::new(vec![Ok("one utterance")]));
    let mut h = start(asr.clone(), Duration::from_secs(10));

    h.feed(2000, 4).await;
    h.feed(0, 10).await; // 1.0 s pause
    h.feed(2000, 4).await;
    h.feed(0, 20).await;

    assert_eq!(asr.calls(), 1);
    let event = h.events.try_recv().unwrap();
    assert_eq!(event.text, "one utterance");
    assert!(h.events.try_recv().is_err());
    h.cancel.cancel();
}

// ── recognizer failures ──

#[tokio::test(start_paused = true)]
async fn asr_failure_emits_empty_non_final_and_keeps_listening() {
    let asr = Arc::new(ScriptedAsr::new(vec![Err("model crashed"), Ok("second try")]));
    let mut h = start(asr.clone(), Duration::from_secs(10));

    h.feed(2000, 5).await;
    h.feed(0, 20).await;
    let failed = h.events.try_recv().unwrap();
    assert_eq!(failed.text, "");
    assert!(!failed.is_final);
    assert!(failed.error.unwrap().contains("model crashed"));

    h.feed(2000, 5).await;
    h.feed(0, 20).await;
    let ok = h.events.try_recv().unwrap();
    assert_eq!(ok.text, "second try");
    assert!(ok.is_final);
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn asr_timeout_is_reported() {
    let asr = Arc::new(ScriptedAsr {
        delay: Duration::from_secs(60),
        ..ScriptedAsr::new(vec![Ok("too late")])
    });
    let mut h = start(asr.clone(), Duration::from_secs(2));

    h.feed(2000, 5).await;
    h.feed(0, 40).await;

    let event = h.events.try_recv().unwrap();
    assert!(!event.is_final);
    assert!(event.error.unwrap().contains("timed out"));
    h.cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn buffer_cap_flushes_without_silence() {
    let asr = Arc::new(ScriptedAsr::new(vec![Ok("long monologue")]));
    let (frames_tx, frames_rx) = mpsc::channel(64);
    let (events_tx, mut events_rx) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    tokio::spawn(run_ingestion(
        VoiceIngestion::new(VadConfig {
            max_buffer_ms: 1_000,
            ..config()
        }),
        asr.clone(),
        Duration::from_secs(10),
        frames_rx,
        events_tx,
        cancel.clone(),
    ));

    for _ in 0..10 {
        frames_tx.send(frame(2000)).await.unwrap();
        tokio::time::sleep(FRAME).await;
    }
    let event = events_rx.try_recv().unwrap();
    assert_eq!(event.text, "long monologue");
    assert_eq!(event.duration, Duration::from_secs(1));
    cancel.cancel();
}
