//! Error types for the voice client

use thiserror::Error;

/// Main error type for the client
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

impl From<cpal::DefaultStreamConfigError> for AudioError {
    fn from(e: cpal::DefaultStreamConfigError) -> Self {
        AudioError::DeviceUnavailable(e.to_string())
    }
}

impl From<cpal::BuildStreamError> for AudioError {
    fn from(e: cpal::BuildStreamError) -> Self {
        match e {
            cpal::BuildStreamError::DeviceNotAvailable => {
                AudioError::DeviceUnavailable(e.to_string())
            }
            cpal::BuildStreamError::StreamConfigNotSupported => {
                AudioError::UnsupportedFormat(e.to_string())
            }
            other => AudioError::StreamError(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for AudioError {
    fn from(e: cpal::PlayStreamError) -> Self {
        AudioError::StreamError(e.to_string())
    }
}

/// Transport and HTTP errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Transport unavailable")]
    TransportUnavailable,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Server error, returned code: {0}")]
    Server(u16),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),
}

/// Construction-time configuration errors
#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("maxBufferLength ({max}) must be greater than triggerBufferLength ({trigger})")]
    TriggerNotBelowCapacity { trigger: usize, max: usize },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to parse config: {0}")]
    Parse(String),
}

/// Result type alias for the client
pub type Result<T> = std::result::Result<T, Error>;
