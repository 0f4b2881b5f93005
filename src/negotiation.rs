//! One-shot room join / leave against the room server

mod http;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::media::IceServerSet;
use crate::signaling::{ClientId, RoomId, SignalingMessage};

pub use http::HttpRoomNegotiator;

/// Room negotiation errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("network error: {0}")]
    Network(String),

    #[error("room server returned status {status}")]
    Status { status: u16 },

    #[error("room server rejected join: {0}")]
    RoomRejected(String),

    #[error("invalid room server response: {0}")]
    InvalidResponse(String),

    #[error("invalid room server url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    pub server_host: Url,
    pub room_id: RoomId,
    pub loopback: bool,
}

/// What the room server hands back on a successful join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomParameters {
    pub client_id: Option<ClientId>,
    pub is_initiator: bool,
    pub ice_servers: IceServerSet,
    pub wss_url: Option<Url>,
    /// HTTP base of the relay.
    pub wss_post_url: Option<Url>,
    /// Signaling left in the room by a peer that joined first.
    pub messages: Vec<SignalingMessage>,
}

/// Registers a client into a room. Implementations never retry.
#[async_trait]
pub trait RoomNegotiator: Send + Sync {
    async fn join(&self, request: &JoinRequest) -> Result<RoomParameters, NegotiationError>;

    async fn leave(
        &self,
        server_host: &Url,
        room_id: &RoomId,
        client_id: &ClientId,
    ) -> Result<(), NegotiationError>;
}
