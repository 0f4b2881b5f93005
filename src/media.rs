//! Local media and the boundary to the external media engine

mod controller;
mod engine;
mod track;

pub use controller::{LocalTracks, MediaController, TrackRequest};
pub use engine::{
    DEFAULT_STUN_URL, EngineError, IceCandidate, IceConnectionState, IceServer, IceServerSet,
    MediaConstraints, MediaEngine, PeerConnectionConfig, PeerTransport, SdpType, SessionDescription,
    StatsReport, TransportEvent, TransportEvents,
};
pub use track::{CapturerHandle, MediaTrack, TrackKind, WeakTrack};
