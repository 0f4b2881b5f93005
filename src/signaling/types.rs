use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::messages::SignalingMessage;

/// Signaling channel errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalingError {
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("connection reset: {0}")]
    ConnectionReset(String),

    #[error("registration failed: {0}")]
    RegistrationFailed(String),

    #[error("malformed payload: {0}")]
    Malformed(String),

    #[error("invalid relay endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("channel closed")]
    Closed,
}

const CLIENT_ID_LEN: usize = 8;
const DIGITS: &[u8] = b"0123456789";

/// Room identifier as issued by the room server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoomId(String);

impl RoomId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RoomId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Client identity used when registering with the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Random 8-digit id, the shape room servers hand out.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let id: String = (0..CLIENT_ID_LEN)
            .map(|_| DIGITS[rng.random_range(0..DIGITS.len())] as char)
            .collect();
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Where and as whom a channel registers. Fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEndpoint {
    pub wss_url: Url,
    /// HTTP base of the relay, used for deregistration on close.
    pub rest_url: Option<Url>,
    pub room_id: RoomId,
    pub client_id: ClientId,
}

impl SignalingEndpoint {
    /// `{rest_url}/{room}/{client}`
    pub fn deregistration_url(&self) -> Option<Url> {
        let mut url = self.rest_url.clone()?;
        {
            let mut segments = url.path_segments_mut().ok()?;
            segments
                .pop_if_empty()
                .push(self.room_id.as_str())
                .push(self.client_id.as_str());
        }
        Some(url)
    }
}

/// Event reported by a channel, stamped with the tag it was opened with.
#[derive(Debug, Clone)]
pub struct ChannelEvent {
    pub tag: u64,
    pub kind: ChannelEventKind,
}

#[derive(Debug, Clone)]
pub enum ChannelEventKind {
    Registered,
    RegistrationFailed(SignalingError),
    Message(SignalingMessage),
    /// Terminal: the channel emits nothing after this.
    Dropped(SignalingError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_generate_has_correct_length() {
        let id = ClientId::generate();
        assert_eq!(id.as_str().len(), 8);
    }

    #[test]
    fn client_id_generate_uses_digits() {
        let id = ClientId::generate();
        for c in id.as_str().chars() {
            assert!(c.is_ascii_digit(), "Invalid char: {}", c);
        }
    }

    #[test]
    fn room_id_display() {
        let room = RoomId::from("abc");
        assert_eq!(format!("{}", room), "abc");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        assert_eq!(serde_json::to_string(&RoomId::from("abc")).unwrap(), "\"abc\"");
        let id: ClientId = serde_json::from_str("\"12345678\"").unwrap();
        assert_eq!(id.as_str(), "12345678");
    }

    #[test]
    fn deregistration_url_appends_room_and_client() {
        let endpoint = SignalingEndpoint {
            wss_url: Url::parse("wss://relay.example/ws").unwrap(),
            rest_url: Some(Url::parse("https://relay.example/api/").unwrap()),
            room_id: RoomId::from("abc"),
            client_id: ClientId::from("42"),
        };
        assert_eq!(
            endpoint.deregistration_url().unwrap().as_str(),
            "https://relay.example/api/abc/42"
        );
    }

    #[test]
    fn deregistration_url_absent_without_rest_url() {
        let endpoint = SignalingEndpoint {
            wss_url: Url::parse("ws://127.0.0.1:1/ws").unwrap(),
            rest_url: None,
            room_id: RoomId::from("abc"),
            client_id: ClientId::from("42"),
        };
        assert!(endpoint.deregistration_url().is_none());
    }
}
