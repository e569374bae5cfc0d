//! Engine error types.

use thiserror::Error;

/// Errors surfaced by the playback engine.
///
/// Connection and decode failures also move the player into `PlaybackState::Error`;
/// invalid settings are only ever reported synchronously from `start`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("decode failure: {0}")]
    DecodeFailure(String),

    #[error("invalid settings: {0}")]
    InvalidSettings(String),

    #[error("audio device failure: {0}")]
    DeviceFailure(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    /// Status code used by the C ABI (`0` is reserved for success).
    pub fn code(&self) -> i32 {
        match self {
            EngineError::ConnectionFailure(_) => 1,
            EngineError::DecodeFailure(_) => 2,
            EngineError::InvalidSettings(_) => 3,
            EngineError::DeviceFailure(_) => 4,
        }
    }
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::InvalidData => EngineError::DecodeFailure(e.to_string()),
            _ => EngineError::ConnectionFailure(e.to_string()),
        }
    }
}

impl From<symphonia::core::errors::Error> for EngineError {
    fn from(e: symphonia::core::errors::Error) -> Self {
        EngineError::DecodeFailure(e.to_string())
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(e: anyhow::Error) -> Self {
        EngineError::DeviceFailure(format!("{e:#}"))
    }
}
