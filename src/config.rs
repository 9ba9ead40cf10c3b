//! Client configuration
//!
//! Settings live in `config.toml` under the platform config directory
//! (resolved with `directories`). Every field has a default, so a missing
//! file or a partial file is valid input; [`ClientConfig::validate`] is the
//! only gate.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::*;
use crate::error::{ConfigError, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub server: ServerConfig,
    pub audio: AudioConfig,
    pub playback: PlaybackConfig,
}

/// Relay server location
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// HTTP base URL, e.g. `http://localhost:3000`
    pub base_url: String,
    /// Path of the WebSocket endpoint relative to `base_url`
    pub socket_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SERVER_URL.to_string(),
            socket_path: "/voice".to_string(),
        }
    }
}

impl ServerConfig {
    /// Base URL without a trailing slash
    pub fn base(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    /// URL for the user listing endpoint
    pub fn users_url(&self) -> String {
        format!("{}/users", self.base())
    }

    /// URL of a sticker sound under the static directory
    pub fn sticker_url(&self, sticker: &str) -> String {
        format!("{}/static/{}.mp3", self.base(), sticker)
    }

    /// WebSocket URL derived from the HTTP base URL
    pub fn websocket_url(&self) -> Result<String> {
        let base = self.base();
        let ws = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            return Err(ConfigError::InvalidUrl(self.base_url.clone()).into());
        };

        let path = self.socket_path.trim_start_matches('/');
        Ok(format!("{}/{}", ws, path))
    }
}

/// Capture and output device settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate used for capture and every output context
    pub sample_rate: u32,
    /// Capture frame length in samples
    pub buffer_size: usize,
    /// Input device name, `None` for the system default
    pub input_device: Option<String>,
    /// Output device name, `None` for the system default
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            buffer_size: DEFAULT_BUFFER_SIZE,
            input_device: None,
            output_device: None,
        }
    }
}

/// Per-peer playback buffer thresholds
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Queue depth above which incoming chunks are dropped
    pub max_buffer_length: usize,
    /// Queue depth at which a filling buffer starts playing
    pub trigger_buffer_length: usize,
    /// Tear down a peer's buffer when the peer leaves
    pub teardown_on_leave: bool,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            max_buffer_length: DEFAULT_MAX_BUFFER_LENGTH,
            trigger_buffer_length: DEFAULT_TRIGGER_BUFFER_LENGTH,
            teardown_on_leave: true,
        }
    }
}

impl PlaybackConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.max_buffer_length == 0 {
            return Err(ConfigError::Zero("maxBufferLength"));
        }
        if self.trigger_buffer_length >= self.max_buffer_length {
            return Err(ConfigError::TriggerNotBelowCapacity {
                trigger: self.trigger_buffer_length,
                max: self.max_buffer_length,
            });
        }
        Ok(())
    }
}

impl ClientConfig {
    const FILE_NAME: &'static str = "config.toml";

    /// Check every invariant the session relies on
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        self.playback.validate()?;

        if self.audio.sample_rate == 0 {
            return Err(ConfigError::Zero("sampleRate"));
        }
        if self.audio.buffer_size == 0 {
            return Err(ConfigError::Zero("bufferSize"));
        }

        let base = self.server.base();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ConfigError::InvalidUrl(self.server.base_url.clone()));
        }

        Ok(())
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> std::result::Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from an explicit path
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        tracing::info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Default config file location, if the platform provides one
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "relay-voice-client")
            .map(|dirs| dirs.config_dir().join(Self::FILE_NAME))
    }

    /// Load from the default location, falling back to defaults when no file exists
    pub fn load_or_default() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => {
                tracing::debug!("No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Serialize to TOML
    pub fn to_toml_string(&self) -> std::result::Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
