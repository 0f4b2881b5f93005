use serde::{Deserialize, Serialize};

use super::types::{ClientId, RoomId, SignalingError};
use crate::media::{IceCandidate, SdpType, SessionDescription};

/// Candidate as carried on the wire: `label` is the m-line index, `id` the mid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub label: u32,
    pub id: String,
    pub candidate: String,
}

impl From<&IceCandidate> for CandidatePayload {
    fn from(candidate: &IceCandidate) -> Self {
        Self {
            label: candidate.sdp_mline_index,
            id: candidate.sdp_mid.clone(),
            candidate: candidate.candidate.clone(),
        }
    }
}

impl From<CandidatePayload> for IceCandidate {
    fn from(payload: CandidatePayload) -> Self {
        IceCandidate {
            sdp_mid: payload.id,
            sdp_mline_index: payload.label,
            candidate: payload.candidate,
        }
    }
}

/// Peer-to-peer messages relayed through the room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalingMessage {
    #[serde(rename = "offer")]
    Offer { sdp: String },

    #[serde(rename = "answer")]
    Answer { sdp: String },

    #[serde(rename = "candidate")]
    Candidate(CandidatePayload),

    #[serde(rename = "remove-candidates")]
    RemoveCandidates { candidates: Vec<CandidatePayload> },

    /// Remote peer left the room
    #[serde(rename = "bye")]
    Bye,

    /// Error reported by the relay itself
    #[serde(rename = "error")]
    Error { message: String },
}

impl SignalingMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::Candidate(_) => "candidate",
            SignalingMessage::RemoveCandidates { .. } => "remove-candidates",
            SignalingMessage::Bye => "bye",
            SignalingMessage::Error { .. } => "error",
        }
    }

    pub fn description(description: SessionDescription) -> Self {
        match description.sdp_type {
            SdpType::Offer => SignalingMessage::Offer {
                sdp: description.sdp,
            },
            SdpType::Answer => SignalingMessage::Answer {
                sdp: description.sdp,
            },
        }
    }

    pub fn candidate(candidate: &IceCandidate) -> Self {
        SignalingMessage::Candidate(CandidatePayload::from(candidate))
    }

    pub fn removed_candidates(candidates: &[IceCandidate]) -> Self {
        SignalingMessage::RemoveCandidates {
            candidates: candidates.iter().map(CandidatePayload::from).collect(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, SignalingError> {
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, SignalingError> {
        serde_json::to_string(self).map_err(|e| SignalingError::Malformed(e.to_string()))
    }
}

/// Commands understood by the relay
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
enum RelayCommand<'a> {
    Register { roomid: &'a str, clientid: &'a str },
    Send { msg: String },
}

/// Frame pushed by the relay; `msg` holds a JSON-encoded `SignalingMessage`.
#[derive(Debug, Deserialize)]
struct RelayFrame {
    #[serde(default)]
    msg: String,
    #[serde(default)]
    error: String,
}

pub fn encode_register(room_id: &RoomId, client_id: &ClientId) -> Result<String, SignalingError> {
    let command = RelayCommand::Register {
        roomid: room_id.as_str(),
        clientid: client_id.as_str(),
    };
    serde_json::to_string(&command).map_err(|e| SignalingError::Malformed(e.to_string()))
}

pub fn encode_send(message: &SignalingMessage) -> Result<String, SignalingError> {
    let command = RelayCommand::Send {
        msg: message.to_json()?,
    };
    serde_json::to_string(&command).map_err(|e| SignalingError::Malformed(e.to_string()))
}

pub fn decode_relay_frame(text: &str) -> Result<SignalingMessage, SignalingError> {
    let frame: RelayFrame =
        serde_json::from_str(text).map_err(|e| SignalingError::Malformed(e.to_string()))?;

    if !frame.error.is_empty() {
        return Ok(SignalingMessage::Error {
            message: frame.error,
        });
    }
    if frame.msg.is_empty() {
        return Err(SignalingError::Malformed("empty relay frame".to_string()));
    }
    SignalingMessage::parse(&frame.msg)
}
