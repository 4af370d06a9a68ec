//! Error types for the speaker bridge.

/// Top-level error type for the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Vendor cloud API transport error (poll/status/command HTTP failures).
    #[error("transport error: {0}")]
    Transport(String),

    /// Vendor account login or session renewal error.
    #[error("auth error: {0}")]
    Auth(String),

    /// Device directory error (unknown hardware, empty device list).
    #[error("device error: {0}")]
    Device(String),

    /// Chat completion request or stream error.
    #[error("chat error: {0}")]
    Chat(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Background task join error.
    #[error("task error: {0}")]
    Task(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, BridgeError>;
