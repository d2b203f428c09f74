//! Error types for the voice session client.

/// Top-level error type for the voice session system.
#[derive(Debug, thiserror::Error)]
pub enum VoiceError {
    /// Microphone or render device could not be acquired.
    ///
    /// Fatal to the connect attempt that triggered it.
    #[error("audio device unavailable: {0}")]
    DeviceUnavailable(String),

    /// Audio device or stream error after acquisition.
    #[error("audio error: {0}")]
    Audio(String),

    /// Inbound chunk payload failed transport-level decoding.
    ///
    /// Local to a single chunk; the session continues.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// Raw audio bytes are inconsistent with the declared format.
    ///
    /// Local to a single chunk; the session continues.
    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    /// The remote session reported an error or closed abnormally.
    #[error("session error: {0}")]
    Session(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, VoiceError>;
