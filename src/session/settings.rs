use serde::Deserialize;

use crate::media::{IceServer, MediaConstraints};

/// Per-call settings snapshot taken when a connect request is made.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CallSettings {
    /// Ask the room server to echo our own media back.
    pub loopback: bool,
    /// Video sender cap in kbps; 0 leaves the engine default.
    pub max_bitrate_kbps: u32,
    pub camera_constraints: MediaConstraints,
    pub stats_enabled: bool,
}

/// TURN server supplied by the caller, tried ahead of negotiated servers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOverride {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

impl From<TurnOverride> for IceServer {
    fn from(turn: TurnOverride) -> Self {
        IceServer::new(turn.urls, turn.username, turn.credential)
    }
}

/// Everything a connect needs. Empty strings count as "not supplied".
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// The far end is a media server, which never sends offers.
    pub use_media_server: bool,
    /// HTTP base of the relay, used to deregister on close.
    pub websocket_url: String,
    pub server_host_url: String,
    pub room_id: String,
    /// Relay socket URL; overrides the one from the room server.
    pub wss_url: String,
    pub client_id: Option<String>,
    pub turn: Option<TurnOverride>,
    pub audio_only: bool,
    pub settings: CallSettings,
}

impl ConnectRequest {
    pub fn new(server_host_url: impl Into<String>, room_id: impl Into<String>) -> Self {
        Self {
            server_host_url: server_host_url.into(),
            room_id: room_id.into(),
            ..Self::default()
        }
    }
}
