//! Error types for the satellite

use thiserror::Error;

/// Result type alias for satellite operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the satellite
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (fail-fast at startup)
    #[error("configuration error: {0}")]
    Config(String),

    /// Wire framing error (fatal for the containing connection)
    #[error("framing error: {0}")]
    Framing(String),

    /// Transport error (connection reset, dial failure)
    #[error("transport error: {0}")]
    Transport(String),

    /// Protocol violation (unexpected message; logged and skipped)
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Event hook subprocess error
    #[error("hook error: {0}")]
    Hook(String),

    /// Audio DSP stage error (stage skipped for the chunk)
    #[error("dsp error: {0}")]
    Dsp(String),

    /// Mic/snd subprocess could not start
    #[error("device busy: {0}")]
    DeviceBusy(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Stable kind label, used to rate-limit error lifecycle events
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Framing(_) => "framing",
            Self::Transport(_) => "transport",
            Self::Protocol(_) => "protocol",
            Self::Hook(_) => "hook",
            Self::Dsp(_) => "dsp",
            Self::DeviceBusy(_) => "device-busy",
            Self::Io(_) => "io",
            Self::Serialization(_) => "serialization",
        }
    }
}
