//! # Relay Voice Client
//!
//! Voice chat over a relay server: microphone audio is sliced into fixed-size
//! frames and sent to the server, and audio relayed from every other
//! participant plays through a per-peer adaptive jitter buffer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────── LOCAL CLIENT ────────────────────────────────┐
//! │                                                                              │
//! │  ┌────────────┐   ┌──────────────────────────┐   ┌────────────────────────┐  │
//! │  │ Microphone │──▶│ CapturePipeline          │──▶│ TransportHandle        │  │
//! │  │ (cpal)     │   │ Framer: bufferSize frames│   │ "radio" events         │──┼──┐
//! │  └────────────┘   └──────────────────────────┘   └────────────────────────┘  │  │
//! │                                                                              │  │
//! │  ┌────────────────────────────────────────────────────────────────────────┐  │  │
//! │  │ VoiceSession (Disconnected | Connected)                                │  │  │
//! │  │   dispatcher task: inbound events ─▶ StreamRouter / EventBus           │  │  │
//! │  └────────────────────────────────────────────────────────────────────────┘  │  │
//! │                │ "voice" {id, blob, sampleRate}                              │  │
//! │                ▼                                                             │  │
//! │  ┌────────────────────────────────────────────────────────────────────────┐  │  │
//! │  │ StreamRouter: peer id ─▶ PlaybackBuffer (lazy, one mutex per peer)     │  │  │
//! │  │   ┌──────────────┐   ┌──────────────┐   ┌──────────────┐               │  │  │
//! │  │   │ Buffer alice │   │ Buffer bob   │   │ Buffer carol │               │  │  │
//! │  │   │ fill ▸ flush │   │ fill ▸ flush │   │ fill ▸ flush │               │  │  │
//! │  │   └──────┬───────┘   └──────┬───────┘   └──────┬───────┘               │  │  │
//! │  └──────────┼──────────────────┼──────────────────┼───────────────────────┘  │  │
//! │             ▼                  ▼                  ▼                          │  │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐                      │  │
//! │  │ Output alice │   │ Output bob   │   │ Output carol │  (clock + mixer)     │  │
//! │  └──────────────┘   └──────────────┘   └──────────────┘                      │  │
//! └──────────────────────────────────────────────────────────────────────────────┘  │
//!                                   ▲ WebSocket (JSON events)                       │
//!                                   └────────────── RELAY SERVER ◀──────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod protocol;
pub mod router;
pub mod session;

pub use error::{Error, Result};
pub use session::{SessionBackends, VoiceSession};

/// Application-wide constants
pub mod constants {
    /// Sample rate for capture and every output context
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Capture frame length in samples
    pub const DEFAULT_BUFFER_SIZE: usize = 2048;

    /// Per-peer playback queue capacity
    pub const DEFAULT_MAX_BUFFER_LENGTH: usize = 16;

    /// Queue depth that starts playback of a filling buffer
    pub const DEFAULT_TRIGGER_BUFFER_LENGTH: usize = 12;

    /// Relay server used when no config file exists
    pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:3000";
}
