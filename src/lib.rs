//! Call-session orchestration for peer-to-peer rooms: room negotiation, relay
//! signaling, local media and the connection state machine that ties them together.

pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod session;
pub mod signaling;

#[cfg(test)]
mod test_support;

pub use config::ClientConfig;
pub use error::CallError;
pub use session::{CallClient, CallEvent, CallObserver, CallSettings, ConnectRequest, ConnectionState, EventStream};
