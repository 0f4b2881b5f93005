use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{JoinRequest, NegotiationError, RoomNegotiator, RoomParameters};
use crate::config::ClientConfig;
use crate::media::{IceServer, IceServerSet};
use crate::signaling::{ClientId, RoomId, SignalingMessage};

const JOIN_SUCCESS: &str = "SUCCESS";

#[derive(Debug, Deserialize)]
struct JoinResponse {
    result: String,
    #[serde(default)]
    params: Option<JoinParams>,
}

#[derive(Debug, Deserialize)]
struct JoinParams {
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    is_initiator: Flag,
    #[serde(default)]
    wss_url: Option<String>,
    #[serde(default)]
    wss_post_url: Option<String>,
    #[serde(default)]
    messages: Vec<String>,
    /// JSON document embedded as a string
    #[serde(default)]
    pc_config: Option<String>,
}

/// Room servers send booleans either as JSON bools or as "true"/"false".
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Text(String),
}

impl Default for Flag {
    fn default() -> Self {
        Flag::Bool(false)
    }
}

impl Flag {
    fn is_set(&self) -> bool {
        match self {
            Flag::Bool(b) => *b,
            Flag::Text(s) => s.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Deserialize)]
struct PeerConnectionConfig {
    #[serde(rename = "iceServers", default)]
    ice_servers: Vec<RawIceServer>,
}

#[derive(Debug, Deserialize)]
struct RawIceServer {
    #[serde(alias = "url")]
    urls: Urls,
    #[serde(default)]
    username: String,
    #[serde(default)]
    credential: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Urls {
    One(String),
    Many(Vec<String>),
}

impl From<RawIceServer> for IceServer {
    fn from(raw: RawIceServer) -> Self {
        let urls = match raw.urls {
            Urls::One(url) => vec![url],
            Urls::Many(urls) => urls,
        };
        IceServer::new(urls, raw.username, raw.credential)
    }
}

/// Room negotiator speaking the `join` / `leave` HTTP API.
#[derive(Debug, Clone)]
pub struct HttpRoomNegotiator {
    client: reqwest::Client,
}

impl HttpRoomNegotiator {
    pub fn new(config: &ClientConfig) -> Result<Self, NegotiationError> {
        let client = reqwest::Client::builder()
            .timeout(config.negotiation_timeout())
            .build()
            .map_err(|e| NegotiationError::Network(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl RoomNegotiator for HttpRoomNegotiator {
    async fn join(&self, request: &JoinRequest) -> Result<RoomParameters, NegotiationError> {
        let mut url = endpoint_url(&request.server_host, &["join", request.room_id.as_str()])?;
        if request.loopback {
            url.query_pairs_mut().append_pair("debug", "loopback");
        }

        debug!("Joining room {} via {}", request.room_id, url);
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| NegotiationError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            warn!("Join for room {} returned {}", request.room_id, status);
            return Err(NegotiationError::Status {
                status: status.as_u16(),
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| NegotiationError::Network(e.to_string()))?;
        let params = parse_join_response(&body)?;

        info!(
            "Joined room {} (initiator: {}, {} queued message(s))",
            request.room_id,
            params.is_initiator,
            params.messages.len()
        );
        Ok(params)
    }

    async fn leave(
        &self,
        server_host: &Url,
        room_id: &RoomId,
        client_id: &ClientId,
    ) -> Result<(), NegotiationError> {
        let url = endpoint_url(server_host, &["leave", room_id.as_str(), client_id.as_str()])?;
        let response = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| NegotiationError::Network(e.to_string()))?;

        if !response.status().is_success() {
            return Err(NegotiationError::Status {
                status: response.status().as_u16(),
            });
        }
        info!("Left room {} as {}", room_id, client_id);
        Ok(())
    }
}

/// `{host}/{segments...}`, tolerating a trailing slash on the host.
fn endpoint_url(host: &Url, segments: &[&str]) -> Result<Url, NegotiationError> {
    let mut url = host.clone();
    url.path_segments_mut()
        .map_err(|_| NegotiationError::InvalidUrl(host.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

fn parse_join_response(body: &str) -> Result<RoomParameters, NegotiationError> {
    let response: JoinResponse =
        serde_json::from_str(body).map_err(|e| NegotiationError::InvalidResponse(e.to_string()))?;

    if response.result != JOIN_SUCCESS {
        return Err(NegotiationError::RoomRejected(response.result));
    }
    let params = response
        .params
        .ok_or_else(|| NegotiationError::InvalidResponse("missing params".to_string()))?;

    let ice_servers = match params.pc_config.as_deref() {
        Some(raw) if !raw.is_empty() => {
            let config: PeerConnectionConfig = serde_json::from_str(raw)
                .map_err(|e| NegotiationError::InvalidResponse(format!("pc_config: {}", e)))?;
            IceServerSet::new(config.ice_servers.into_iter().map(IceServer::from).collect())
        }
        _ => IceServerSet::default(),
    };

    let messages = params
        .messages
        .iter()
        .filter_map(|raw| match SignalingMessage::parse(raw) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!("Skipping malformed queued room message: {}", e);
                None
            }
        })
        .collect();

    Ok(RoomParameters {
        client_id: params.client_id.filter(|id| !id.is_empty()).map(ClientId::from),
        is_initiator: params.is_initiator.is_set(),
        ice_servers,
        wss_url: parse_optional_url(params.wss_url)?,
        wss_post_url: parse_optional_url(params.wss_post_url)?,
        messages,
    })
}

fn parse_optional_url(raw: Option<String>) -> Result<Option<Url>, NegotiationError> {
    match raw {
        Some(raw) if !raw.is_empty() => Url::parse(&raw)
            .map(Some)
            .map_err(|e| NegotiationError::InvalidResponse(format!("{}: {}", raw, e))),
        _ => Ok(None),
    }
}
