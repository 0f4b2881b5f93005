use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use super::track::{CapturerHandle, MediaTrack};

/// Fallback when neither the room server nor the caller names an ICE server.
pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// Failures reported by the external media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("capture device unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("session description rejected: {0}")]
    Description(String),

    #[error("peer connection failure: {0}")]
    PeerConnection(String),

    #[error("transport closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub credential: String,
}

impl IceServer {
    pub fn new(urls: Vec<String>, username: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            urls,
            username: username.into(),
            credential: credential.into(),
        }
    }
}

/// Ordered ICE server list handed to the transport at setup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IceServerSet(Vec<IceServer>);

impl IceServerSet {
    pub fn new(servers: Vec<IceServer>) -> Self {
        Self(servers)
    }

    /// Caller-supplied TURN first, then whatever negotiation returned.
    /// Falls back to a public STUN server when both are empty.
    pub fn resolve(negotiated: IceServerSet, turn_override: Option<IceServer>) -> Self {
        let mut servers: Vec<IceServer> = turn_override
            .into_iter()
            .filter(|server| !server.urls.is_empty())
            .collect();
        servers.extend(negotiated.0);

        if servers.is_empty() {
            servers.push(IceServer::new(vec![DEFAULT_STUN_URL.to_string()], "", ""));
        }
        Self(servers)
    }

    pub fn as_slice(&self) -> &[IceServer] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpType {
    Offer,
    Answer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub sdp_type: SdpType,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub sdp_mid: String,
    pub sdp_mline_index: u32,
    pub candidate: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceConnectionState {
    /// Media can flow.
    pub fn is_usable(self) -> bool {
        matches!(self, IceConnectionState::Connected | IceConnectionState::Completed)
    }

    pub fn is_terminal_failure(self) -> bool {
        self == IceConnectionState::Failed
    }
}

/// Key/value constraints passed through to capture and peer connection setup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConstraints {
    pub mandatory: BTreeMap<String, String>,
    pub optional: BTreeMap<String, String>,
}

impl MediaConstraints {
    pub fn is_empty(&self) -> bool {
        self.mandatory.is_empty() && self.optional.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PeerConnectionConfig {
    pub ice_servers: IceServerSet,
    pub constraints: MediaConstraints,
}

/// One entry of a statistics snapshot, forwarded to the observer untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct StatsReport {
    pub id: String,
    pub kind: String,
    pub timestamp_us: f64,
    pub values: BTreeMap<String, String>,
}

/// Asynchronous notifications from a peer transport
#[derive(Debug, Clone)]
pub enum TransportEvent {
    IceConnectionChanged(IceConnectionState),
    LocalCandidate(IceCandidate),
    LocalCandidatesRemoved(Vec<IceCandidate>),
    RemoteVideoTrack(MediaTrack),
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

/// Capability of the platform media stack: capture, encoding and peer connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// The transport reports its events on `events` until it is closed.
    async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, EngineError>;

    async fn create_audio_track(&self, constraints: &MediaConstraints) -> Result<MediaTrack, EngineError>;

    async fn create_video_track(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<(MediaTrack, CapturerHandle), EngineError>;

    /// Moves capture to the next camera and returns the capturer now in use.
    async fn switch_camera(&self, capturer: &CapturerHandle) -> Result<CapturerHandle, EngineError> {
        Err(EngineError::CaptureUnavailable(format!(
            "no other camera than {}",
            capturer.device_id
        )))
    }

    /// Platform audio session activation; engines without one ignore it.
    fn set_audio_session_active(&self, _active: bool) {}
}

/// A single peer connection owned by the engine.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    async fn create_answer(&self) -> Result<SessionDescription, EngineError>;

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError>;

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), EngineError>;

    /// Cap for video senders, in bits per second.
    async fn set_max_bitrate(&self, bps: u32) -> Result<(), EngineError>;

    async fn stats(&self) -> Result<Vec<StatsReport>, EngineError>;

    async fn close(&self);
}
