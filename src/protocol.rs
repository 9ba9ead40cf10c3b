//! Wire events exchanged with the relay server
//!
//! Every WebSocket text message is one JSON object of the form
//! `{"event": "<name>", "data": { ... }}`.

use serde::{Deserialize, Serialize};

use crate::error::NetworkError;

/// Voice chunk relayed from another participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoicePayload {
    pub id: String,
    pub blob: Vec<f32>,
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
}

/// Event that only names a participant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRef {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StickerPayload {
    pub sticker: String,
}

/// Locally captured frame sent for relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioPayload {
    #[serde(rename = "sampleRate")]
    pub sample_rate: u32,
    pub blob: Vec<f32>,
}

/// Events received from the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    /// Handshake carrying the id the server assigned to this client
    Connected(PeerRef),
    Voice(VoicePayload),
    UserJoin(PeerRef),
    UserLeave(PeerRef),
    UserSpeak(PeerRef),
    AudioSticker(StickerPayload),
}

impl InboundEvent {
    pub fn from_json(text: &str) -> Result<Self, NetworkError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Wire name of the event
    pub fn name(&self) -> &'static str {
        match self {
            InboundEvent::Connected(_) => "connected",
            InboundEvent::Voice(_) => "voice",
            InboundEvent::UserJoin(_) => "user_join",
            InboundEvent::UserLeave(_) => "user_leave",
            InboundEvent::UserSpeak(_) => "user_speak",
            InboundEvent::AudioSticker(_) => "audio_sticker",
        }
    }
}

/// Events sent to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum OutboundEvent {
    Radio(RadioPayload),
    AudioSticker(StickerPayload),
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, NetworkError> {
        Ok(serde_json::to_string(self)?)
    }
}
