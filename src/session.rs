//! The call coordinator: connection state machine, signaling dispatch and the
//! observer surface

mod client;
mod coordinator;
mod observer;
mod settings;
mod state;


pub use client::CallClient;
pub use observer::{CallEvent, CallObserver, EventStream};
pub use settings::{CallSettings, ConnectRequest, TurnOverride};
pub use state::ConnectionState;
