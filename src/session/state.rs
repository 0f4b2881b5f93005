use std::fmt;

use crate::error::CallError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
        }
    }
}

/// Connection state with the legal transitions enforced.
#[derive(Debug)]
pub(crate) struct StateMachine {
    state: ConnectionState,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.state
    }

    pub fn transition(&mut self, to: ConnectionState) -> Result<(), CallError> {
        use ConnectionState::*;

        match (self.state, to) {
            (Disconnected, Connecting) | (Connecting, Connected) | (Connecting | Connected, Disconnected) => {
                self.state = to;
                Ok(())
            }
            (from, to) => Err(CallError::IllegalTransition { from, to }),
        }
    }
}
