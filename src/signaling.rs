//! WebSocket relay client for exchanging signaling messages within a room

mod channel;
mod messages;
mod queue;
mod types;

pub use channel::SignalingChannel;
pub use messages::{CandidatePayload, SignalingMessage, decode_relay_frame, encode_register, encode_send};
pub use queue::PendingQueue;
pub use types::{ChannelEvent, ChannelEventKind, ClientId, RoomId, SignalingEndpoint, SignalingError};
