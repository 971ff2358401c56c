//! Ordered publication of synthesized speech.
//!
//! Sentences of one assistant message are synthesized by a small pool of
//! workers, so their audio can finish out of order. A [`ReorderBuffer`]
//! keyed by sentence sequence number holds early results until every
//! earlier sentence has been published or skipped.
//!
//! A semaphore bounds the sentences in flight between `submit` and
//! publication, so neither the job queue nor the reorder buffer grows past
//! the configured window.

use crate::audio::{frame_pcm16, pcm16_duration, resample_pcm16, upmix};
use crate::config::OutputFormat;
use crate::error::VoiceError;
use crate::ports::TtsPort;
use cadence_protocol::Transport;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Releases items strictly in sequence order, starting from 0.
#[derive(Debug)]
pub struct ReorderBuffer<T> {
    next: u32,
    pending: BTreeMap<u32, T>,
}

impl<T> Default for ReorderBuffer<T> {
    fn default() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<T> ReorderBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `item` for `sequence`. Stale or duplicate sequences are dropped.
    pub fn insert(&mut self, sequence: u32, item: T) -> bool {
        if sequence < self.next || self.pending.contains_key(&sequence) {
            return false;
        }
        self.pending.insert(sequence, item);
        true
    }

    /// Removes and returns the next in-order item, if it has arrived.
    pub fn pop_ready(&mut self) -> Option<(u32, T)> {
        let item = self.pending.remove(&self.next)?;
        let sequence = self.next;
        self.next += 1;
        Some((sequence, item))
    }

    pub fn next_sequence(&self) -> u32 {
        self.next
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Reported once per sentence after it has been published or skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechOutcome {
    pub message_id: String,
    pub sequence: u32,
    /// Mono PCM16 as returned by the synthesizer. `None` if synthesis failed.
    pub audio: Option<Vec<u8>>,
    pub duration_ms: Option<u32>,
}

/// Totals for one message, returned by [`AudioOutputSynchronizer::finish`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechSummary {
    pub published: Vec<u32>,
    pub skipped: Vec<u32>,
}

#[derive(Debug, Clone)]
pub struct SynchronizerConfig {
    pub workers: usize,
    pub tts_timeout: Duration,
    pub output: OutputFormat,
    pub voice: Option<String>,
    /// Sentences that may be queued, synthesizing or waiting for
    /// publication at once. `submit` waits while the window is full.
    pub window: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tts_timeout: Duration::from_secs(10),
            output: OutputFormat::default(),
            voice: None,
            window: 8,
        }
    }
}

struct Job {
    sequence: u32,
    text: String,
    permit: OwnedSemaphorePermit,
}

/// Synthesizer output already converted to the playback format.
struct Rendered {
    pcm: Vec<u8>,
    sample_rate: u32,
    frames: Vec<Vec<u8>>,
}

struct Finished {
    sequence: u32,
    audio: Option<Rendered>,
    // Held until the sentence is published or skipped.
    _permit: OwnedSemaphorePermit,
}

/// Per-message speech pipeline: `submit` sentences, then `finish`.
pub struct AudioOutputSynchronizer {
    message_id: String,
    jobs: Option<mpsc::Sender<Job>>,
    window: Arc<Semaphore>,
    window_size: usize,
    cancel: CancellationToken,
    workers: Vec<JoinHandle<()>>,
    publisher: JoinHandle<SpeechSummary>,
}

impl AudioOutputSynchronizer {
    /// Starts the worker pool and the publisher for `message_id`.
    ///
    /// `cancel` is typically a child of the message's generation token, so
    /// stopping the message also stops its speech.
    pub fn start(
        message_id: impl Into<String>,
        tts: Arc<dyn TtsPort>,
        transport: Arc<dyn Transport>,
        config: SynchronizerConfig,
        outcomes: Option<mpsc::UnboundedSender<SpeechOutcome>>,
        cancel: CancellationToken,
    ) -> Self {
        let message_id = message_id.into();
        let workers = config.workers.max(1);
        let window = config.window.max(workers);
        let (jobs_tx, jobs_rx) = mpsc::channel::<Job>(window);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (done_tx, done_rx) = mpsc::channel::<Finished>(window);
        let voice: Option<Arc<str>> = config.voice.as_deref().map(Arc::from);
        let output = config.output;

        let workers = (0..workers)
            .map(|_| {
                let jobs_rx = jobs_rx.clone();
                let done_tx = done_tx.clone();
                let tts = tts.clone();
                let cancel = cancel.clone();
                let voice = voice.clone();
                let message_id = message_id.clone();
                let timeout = config.tts_timeout;
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = jobs_rx.lock().await;
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                job = rx.recv() => job,
                            }
                        };
                        let Some(job) = job else { return };

                        let result = tokio::select! {
                            _ = cancel.cancelled() => return,
                            r = tokio::time::timeout(timeout, tts.synthesize(&job.text, voice.as_deref())) => r,
                        };
                        let audio = match result {
                            Ok(Ok(audio)) if !audio.pcm.is_empty() => {
                                let rate = audio.sample_rate;
                                render(&message_id, job.sequence, audio.pcm, rate, output).await
                            }
                            Ok(Ok(_)) => None,
                            Ok(Err(e)) => {
                                tracing::warn!(
                                    message_id = %message_id,
                                    sequence = job.sequence,
                                    "speech synthesis failed; skipping audio: {}",
                                    e
                                );
                                None
                            }
                            Err(_) => {
                                tracing::warn!(
                                    message_id = %message_id,
                                    sequence = job.sequence,
                                    "speech synthesis timed out; skipping audio"
                                );
                                None
                            }
                        };
                        let finished = Finished {
                            sequence: job.sequence,
                            audio,
                            _permit: job.permit,
                        };
                        if done_tx.send(finished).await.is_err() {
                            return;
                        }
                    }
                })
            })
            .collect();
        drop(done_tx);

        let publisher = tokio::spawn(publish_in_order(
            message_id.clone(),
            transport,
            done_rx,
            outcomes,
            cancel.clone(),
        ));

        Self {
            message_id,
            jobs: Some(jobs_tx),
            window: Arc::new(Semaphore::new(window)),
            window_size: window,
            cancel,
            workers,
            publisher,
        }
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Queues a sentence for synthesis. Sequences must be submitted
    /// contiguously from 0.
    ///
    /// Waits while the window of unpublished sentences is full. Returns
    /// without queueing once the synchronizer is cancelled.
    pub async fn submit(&self, sequence: u32, text: impl Into<String>) {
        let text = text.into();
        let Some(jobs) = &self.jobs else { return };
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return,
            permit = self.window.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return,
            },
        };
        let _ = jobs
            .send(Job {
                sequence,
                text,
                permit,
            })
            .await;
    }

    /// Sentences currently holding a slot in the window.
    pub fn in_flight(&self) -> usize {
        self.window_size.saturating_sub(self.window.available_permits())
    }

    /// Stops synthesis and publication. Already-published frames stand.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Closes the queue. The returned handle resolves once every submitted
    /// sentence has been published or skipped.
    pub fn finish(mut self) -> JoinHandle<SpeechSummary> {
        self.jobs.take();
        let workers = std::mem::take(&mut self.workers);
        let publisher = self.publisher;
        tokio::spawn(async move {
            for worker in workers {
                let _ = worker.await;
            }
            publisher.await.unwrap_or_default()
        })
    }
}

/// Resamples, upmixes and frames synthesizer output off the runtime threads.
async fn render(
    message_id: &str,
    sequence: u32,
    pcm: Vec<u8>,
    sample_rate: u32,
    output: OutputFormat,
) -> Option<Rendered> {
    let converted = tokio::task::spawn_blocking(move || {
        let resampled = resample_pcm16(&pcm, sample_rate, output.sample_rate)?;
        let out = upmix(&resampled, output.channels);
        let frames = frame_pcm16(&out, output.sample_rate, output.channels, output.frame_ms);
        Ok::<_, VoiceError>(Rendered {
            pcm,
            sample_rate,
            frames,
        })
    })
    .await;
    match converted {
        Ok(Ok(rendered)) => Some(rendered),
        Ok(Err(e)) => {
            tracing::warn!(
                message_id = %message_id,
                sequence,
                "speech conversion failed; skipping audio: {}",
                e
            );
            None
        }
        Err(e) => {
            tracing::warn!(
                message_id = %message_id,
                sequence,
                "speech conversion task failed: {}",
                e
            );
            None
        }
    }
}

async fn publish_in_order(
    message_id: String,
    transport: Arc<dyn Transport>,
    mut done: mpsc::Receiver<Finished>,
    outcomes: Option<mpsc::UnboundedSender<SpeechOutcome>>,
    cancel: CancellationToken,
) -> SpeechSummary {
    let mut reorder = ReorderBuffer::<Finished>::new();
    let mut summary = SpeechSummary::default();

    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = done.recv() => next,
        };
        let Some(finished) = next else { break };
        reorder.insert(finished.sequence, finished);

        while let Some((sequence, finished)) = reorder.pop_ready() {
            let outcome = match finished.audio {
                Some(rendered) => {
                    let duration = pcm16_duration(rendered.pcm.len(), rendered.sample_rate, 1);
                    let mut delivered = true;
                    for frame in rendered.frames {
                        let sent = tokio::select! {
                            _ = cancel.cancelled() => return summary,
                            sent = transport.publish_audio_frame(frame) => sent,
                        };
                        if let Err(e) = sent {
                            tracing::warn!(
                                message_id = %message_id,
                                sequence,
                                "audio frame publish failed; abandoning sentence audio: {}",
                                e
                            );
                            delivered = false;
                            break;
                        }
                    }
                    if delivered {
                        summary.published.push(sequence);
                    } else {
                        summary.skipped.push(sequence);
                    }
                    SpeechOutcome {
                        message_id: message_id.clone(),
                        sequence,
                        audio: Some(rendered.pcm),
                        duration_ms: Some(duration.as_millis().min(u32::MAX as u128) as u32),
                    }
                }
                None => {
                    summary.skipped.push(sequence);
                    SpeechOutcome {
                        message_id: message_id.clone(),
                        sequence,
                        audio: None,
                        duration_ms: None,
                    }
                }
            };
            if let Some(tx) = &outcomes {
                let _ = tx.send(outcome);
            }
        }
    }

    if reorder.pending() > 0 && !cancel.is_cancelled() {
        tracing::warn!(
            message_id = %message_id,
            waiting_for = reorder.next_sequence(),
            "speech queue closed with out-of-order sentences left"
        );
    }
    summary
}
