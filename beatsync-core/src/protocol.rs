use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::Config;

/// Server time as UNIX epoch milliseconds.
pub type Timestamp = u64;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame is not a known message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("Position ({x}, {y}) is outside the grid")]
    PositionOutOfBounds { x: f64, y: f64 },
    #[error("Volume {0} is outside [0, 1]")]
    VolumeOutOfRange(f64),
    #[error("Chat message is empty")]
    EmptyChatMessage,
    #[error("Chat message exceeds {0} characters")]
    ChatMessageTooLong(usize),
    #[error("Round-trip time {0} is negative")]
    NegativeRtt(f64),
}

/// A point on the listening grid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

/// Where a client is in the world, resolved from its IP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub city: String,
    pub region: String,
    pub country: String,
    pub country_code: String,
    #[serde(rename = "flagSvgURL")]
    pub flag_svg_url: String,
}

/// The presence view of a single client, as sent over the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientData {
    pub username: String,
    pub client_id: String,
    pub rtt: f64,
    pub position: Position,
    pub last_ntp_response: Timestamp,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    pub joined_at: Timestamp,
}

/// One entry in a room's audio queue. The url is opaque to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioSource {
    pub url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaybackKind {
    Paused,
    Playing,
}

/// What a room is currently doing, and since when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybackState {
    #[serde(rename = "type")]
    pub kind: PlaybackKind,
    pub audio_source: String,
    pub server_time_to_execute: Timestamp,
    pub track_position_seconds: f64,
}

impl Default for PlaybackState {
    fn default() -> Self {
        Self {
            kind: PlaybackKind::Paused,
            audio_source: String::new(),
            server_time_to_execute: 0,
            track_position_seconds: 0.,
        }
    }
}

/// Who may mutate room state besides admins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permissions {
    Everyone,
    AdminOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: u64,
    pub client_id: String,
    pub username: String,
    pub text: String,
    pub timestamp: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub country_code: Option<String>,
}

/// Per-client gain parameters published by the spatial loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GainParams {
    pub gain: f64,
    pub ramp_time: f64,
}

/// Every frame a client may send. Closed set; anything else fails decoding.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientRequest {
    /// A time-sync probe. `rtt` piggybacks the client's current round-trip
    /// measurement so the server can schedule around its worst peer.
    NtpRequest {
        t0: f64,
        #[serde(default)]
        rtt: Option<f64>,
    },
    #[serde(rename_all = "camelCase")]
    Play {
        audio_source: String,
        #[serde(default)]
        track_time_seconds: f64,
    },
    #[serde(rename_all = "camelCase")]
    Pause {
        #[serde(default)]
        audio_source: String,
        #[serde(default)]
        track_time_seconds: f64,
    },
    Sync,
    StartSpatialAudio,
    StopSpatialAudio,
    #[serde(rename_all = "camelCase")]
    ReorderClient { client_id: String },
    SetListeningSource { x: f64, y: f64 },
    MoveClient { x: f64, y: f64 },
    #[serde(rename_all = "camelCase")]
    SetAdmin { client_id: String, is_admin: bool },
    SetPlaybackControls { permissions: Permissions },
    SetGlobalVolume { volume: f64 },
    SendChatMessage { text: String },
    SendIp { ip: String },
    AudioSourceLoaded { url: String },
    LoadDefaultTracks,
    DeleteAudioSources { urls: Vec<String> },
    SearchMusic { query: String },
    #[serde(rename_all = "camelCase")]
    StreamMusic { track_id: String },
}

impl ClientRequest {
    /// Range checks that decoding alone cannot express. A frame that fails
    /// here is answered with an ERROR frame and dropped.
    pub fn validate(&self, config: &Config) -> Result<(), ProtocolError> {
        match self {
            Self::NtpRequest { rtt: Some(rtt), .. } if *rtt < 0. => {
                Err(ProtocolError::NegativeRtt(*rtt))
            }
            Self::MoveClient { x, y } | Self::SetListeningSource { x, y } => {
                let in_grid = (0. ..=config.grid_size).contains(x)
                    && (0. ..=config.grid_size).contains(y);

                if in_grid {
                    Ok(())
                } else {
                    Err(ProtocolError::PositionOutOfBounds { x: *x, y: *y })
                }
            }
            Self::SetGlobalVolume { volume } if !(0. ..=1.).contains(volume) => {
                Err(ProtocolError::VolumeOutOfRange(*volume))
            }
            Self::SendChatMessage { text } => {
                let trimmed = text.trim();

                if trimmed.is_empty() {
                    Err(ProtocolError::EmptyChatMessage)
                } else if trimmed.chars().count() > config.chat_max_message_length {
                    Err(ProtocolError::ChatMessageTooLong(
                        config.chat_max_message_length,
                    ))
                } else {
                    Ok(())
                }
            }
            _ => Ok(()),
        }
    }
}

/// An action every client must perform at the same server timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduledAction {
    #[serde(rename_all = "camelCase")]
    Play {
        audio_source: String,
        track_time_seconds: f64,
    },
    Pause,
    #[serde(rename_all = "camelCase")]
    SpatialConfig {
        listening_source: Position,
        gains: HashMap<String, GainParams>,
        ramp_time: f64,
    },
    StopSpatialAudio,
    #[serde(rename_all = "camelCase")]
    GlobalVolumeConfig { volume: f64, ramp_time: f64 },
}

/// A room state change that takes effect immediately on receipt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomEvent {
    ClientChange {
        clients: Vec<ClientData>,
    },
    #[serde(rename_all = "camelCase")]
    SetAudioSources {
        sources: Vec<AudioSource>,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_audio_source: Option<String>,
    },
    SetPlaybackControls {
        permissions: Permissions,
    },
    #[serde(rename_all = "camelCase")]
    ChatUpdate {
        messages: Vec<ChatMessage>,
        is_full_sync: bool,
        newest_id: u64,
    },
    #[serde(rename_all = "camelCase")]
    LoadAudioSource { audio_source_to_play: String },
}

/// Every frame the server may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerMessage {
    NtpResponse {
        t0: f64,
        t1: f64,
        t2: f64,
    },
    #[serde(rename_all = "camelCase")]
    ScheduledAction {
        server_time_to_execute: Timestamp,
        scheduled_action: ScheduledAction,
    },
    RoomEvent {
        event: RoomEvent,
    },
    #[serde(rename_all = "camelCase")]
    StreamJobUpdate { active_job_count: usize },
    SearchResponse {
        results: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn invalid_format() -> Self {
        Self::Error {
            message: "Invalid message format".to_string(),
        }
    }
}

/// Decodes a single inbound frame. Validation is a separate step so the
/// caller can stamp timestamps before any parsing work happens.
pub fn decode_request(text: &str) -> Result<ClientRequest, ProtocolError> {
    Ok(serde_json::from_str(text)?)
}

pub fn encode_message(message: &ServerMessage) -> String {
    serde_json::to_string(message).expect("server messages serialize")
}
