//! Error types for the keyvox controller core

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias for keyvox operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the keyvox core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Channel setup or connection error
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed packet or request payload
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Speech synthesis error
    #[error("speech error: {0}")]
    Speech(String),

    /// Phrase cache error
    #[error("cache error: {0}")]
    Cache(String),

    /// Keypad device error
    #[error("keypad error: {0}")]
    Keypad(String),

    /// No response arrived before the deadline
    #[error("timed out waiting for {0}")]
    Timeout(String),

    /// Peer closed the channel or the component was shut down
    #[error("closed: {0}")]
    Closed(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WAV encoding or decoding error
    #[error("wav error: {0}")]
    Wav(#[from] hound::Error),
}

impl Error {
    /// Whether this error is a timeout that the caller may retry
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
