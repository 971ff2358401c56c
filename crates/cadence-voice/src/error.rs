use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("LiveKit API error: {0}")]
    LiveKit(#[from] livekit_api::access_token::AccessTokenError),

    #[error("Room service error: {0}")]
    RoomService(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("TTS error: {0}")]
    Tts(String),

    #[error("ASR error: {0}")]
    Asr(String),

    #[error("Invalid audio: {0}")]
    Audio(String),

    #[error("{operation} timed out after {seconds:.1}s")]
    Timeout { operation: &'static str, seconds: f64 },
}

impl VoiceError {
    pub(crate) fn timeout(operation: &'static str, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation,
            seconds: after.as_secs_f64(),
        }
    }
}
