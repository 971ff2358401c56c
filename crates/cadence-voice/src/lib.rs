//! Voice infrastructure for cadence sessions.
//!
//! Inbound, client audio runs through an energy-based voice activity
//! detector ([`ingest`]) that buffers speech, waits for trailing silence and
//! hands complete utterances to a speech recognizer. Outbound, assistant
//! sentences are synthesized concurrently and published strictly in
//! sentence order ([`synchronizer`]).
//!
//! Recognizers and synthesizers sit behind [`AsrPort`] and [`TtsPort`];
//! [`WhisperAsr`] and [`PiperTts`] drive local whisper.cpp and piper
//! binaries. [`LiveKitRooms`] manages the transport room that backs each
//! conversation.

pub mod audio;
pub mod config;
pub mod error;
pub mod ingest;
pub mod ports;
pub mod rooms;
pub mod stt;
pub mod synchronizer;
pub mod tts;

pub use config::{LiveKitConfig, OutputFormat, VadConfig};
pub use error::VoiceError;
pub use ingest::{run_ingestion, IngestionState, TranscriptionEvent, VoiceIngestion};
pub use ports::{AsrPort, AudioFormat, SynthesizedAudio, TtsPort};
pub use rooms::{LiveKitRooms, RoomPort};
pub use stt::WhisperAsr;
pub use synchronizer::{
    AudioOutputSynchronizer, ReorderBuffer, SpeechOutcome, SpeechSummary, SynchronizerConfig,
};
pub use tts::PiperTts;
