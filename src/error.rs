use thiserror::Error;

use crate::media::EngineError;
use crate::negotiation::NegotiationError;
use crate::session::ConnectionState;
use crate::signaling::SignalingError;

/// Errors surfaced to callers and to the observer.
#[derive(Debug, Clone, Error)]
pub enum CallError {
    #[error("room negotiation failed: {0}")]
    NegotiationFailed(#[from] NegotiationError),

    #[error("signaling unavailable: {0}")]
    SignalingUnavailable(#[from] SignalingError),

    #[error("malformed signaling message: {0}")]
    SignalingMalformed(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("already connected (state: {0})")]
    AlreadyConnected(ConnectionState),

    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    #[error("illegal state transition: {from} -> {to}")]
    IllegalTransition {
        from: ConnectionState,
        to: ConnectionState,
    },

    #[error("no earlier call to reconnect")]
    NoPreviousCall,

    #[error("call client has shut down")]
    ClientClosed,
}

impl CallError {
    pub(crate) fn transport(err: EngineError) -> Self {
        CallError::TransportFailed(err.to_string())
    }

    pub(crate) fn media(err: EngineError) -> Self {
        CallError::MediaUnavailable(err.to_string())
    }
}
