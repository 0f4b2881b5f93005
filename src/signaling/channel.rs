use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::{self, Bytes, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::messages::{SignalingMessage, decode_relay_frame, encode_register, encode_send};
use super::queue::PendingQueue;
use super::types::{ChannelEvent, ChannelEventKind, SignalingEndpoint, SignalingError};
use crate::config::ClientConfig;

type RelaySocket = WebSocketStream<MaybeTlsStream<TcpStream>>;
type RelaySink = SplitSink<RelaySocket, Message>;

const DEREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

enum ChannelCommand {
    Send(SignalingMessage),
    Close,
}

#[derive(Debug, Clone, Copy)]
struct ChannelTiming {
    connect_timeout: Duration,
    ping_interval: Duration,
    pong_timeout: Duration,
}

/// Persistent relay connection for one room registration.
///
/// The socket lives in a background task. Registration is reported exactly once
/// (`Registered` or `RegistrationFailed`); afterwards inbound messages flow until
/// the relay drops the connection (`Dropped`, terminal) or the channel is closed,
/// after which nothing more is emitted.
pub struct SignalingChannel {
    tx: mpsc::UnboundedSender<ChannelCommand>,
    closed: bool,
    task: Option<JoinHandle<()>>,
}

impl SignalingChannel {
    pub fn open(
        endpoint: SignalingEndpoint,
        config: &ClientConfig,
        tag: u64,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let timing = ChannelTiming {
            connect_timeout: config.relay_connect_timeout(),
            ping_interval: config.ping_interval(),
            pong_timeout: config.pong_timeout(),
        };

        debug!(
            "Opening signaling channel to {} for room {}",
            endpoint.wss_url, endpoint.room_id
        );
        let task = tokio::spawn(run_channel(endpoint, timing, tag, rx, events));

        Self {
            tx,
            closed: false,
            task: Some(task),
        }
    }

    /// Queue a message; held back until registration completes.
    pub fn send(&self, message: SignalingMessage) {
        if self.closed {
            debug!("Channel closed, dropping outbound {} message", message.kind());
            return;
        }
        if self.tx.send(ChannelCommand::Send(message)).is_err() {
            debug!("Channel task gone, dropping outbound message");
        }
    }

    /// Graceful shutdown. Messages still waiting for registration are discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.tx.send(ChannelCommand::Close);
    }

    /// Closes and waits until the close frame and deregistration have gone out.
    pub async fn shutdown(mut self) {
        self.close();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                debug!("Channel task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn run_channel(
    endpoint: SignalingEndpoint,
    timing: ChannelTiming,
    tag: u64,
    mut commands: mpsc::UnboundedReceiver<ChannelCommand>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    let emit = |kind: ChannelEventKind| {
        let _ = events.send(ChannelEvent { tag, kind });
    };

    let mut pending = PendingQueue::default();
    let connect = connect_and_register(&endpoint, timing.connect_timeout);
    tokio::pin!(connect);

    let mut socket = loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(ChannelCommand::Send(message)) => pending.push(message),
                Some(ChannelCommand::Close) | None => {
                    let discarded = pending.discard();
                    debug!(
                        "Channel closed before registration, {} queued message(s) discarded",
                        discarded
                    );
                    return;
                }
            },

            result = &mut connect => match result {
                Ok(socket) => break socket,
                Err(e) => {
                    warn!("Relay registration failed for room {}: {}", endpoint.room_id, e);
                    emit(ChannelEventKind::RegistrationFailed(e));
                    return;
                }
            },
        }
    };

    // Commands queued while the handshake finished; a close still discards.
    loop {
        match commands.try_recv() {
            Ok(ChannelCommand::Send(message)) => pending.push(message),
            Ok(ChannelCommand::Close) | Err(TryRecvError::Disconnected) => {
                let discarded = pending.discard();
                debug!(
                    "Channel closed during registration, {} queued message(s) discarded",
                    discarded
                );
                let _ = socket.close(None).await;
                deregister(&endpoint).await;
                return;
            }
            Err(TryRecvError::Empty) => break,
        }
    }

    info!(
        "Registered with relay for room {} as {}",
        endpoint.room_id, endpoint.client_id
    );
    emit(ChannelEventKind::Registered);

    let (mut ws_tx, mut ws_rx) = socket.split();

    let flushed = pending.len();
    for message in pending.drain() {
        if let Err(e) = send_message(&mut ws_tx, &message).await {
            warn!("Relay connection lost while flushing: {}", e);
            emit(ChannelEventKind::Dropped(e));
            return;
        }
    }
    if flushed > 0 {
        debug!("Flushed {} queued message(s) to relay", flushed);
    }

    let mut ping_interval =
        tokio::time::interval_at(Instant::now() + timing.ping_interval, timing.ping_interval);
    let mut waiting_for_pong = false;
    let mut pong_deadline: Option<Instant> = None;

    let reason = loop {
        let deadline = pong_deadline;
        let pong_timeout = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = ping_interval.tick() => {
                if waiting_for_pong {
                    break SignalingError::ConnectionReset("no pong from relay".to_string());
                }
                if let Err(e) = ws_tx.send(Message::Ping(Bytes::new())).await {
                    break SignalingError::ConnectionReset(e.to_string());
                }
                waiting_for_pong = true;
                pong_deadline = Some(Instant::now() + timing.pong_timeout);
                debug!("Ping sent to relay");
            }

            _ = pong_timeout => {
                break SignalingError::ConnectionReset("pong timeout".to_string());
            }

            command = commands.recv() => match command {
                Some(ChannelCommand::Send(message)) => {
                    if let Err(e) = send_message(&mut ws_tx, &message).await {
                        break e;
                    }
                }
                Some(ChannelCommand::Close) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    info!("Signaling channel for room {} closed", endpoint.room_id);
                    deregister(&endpoint).await;
                    return;
                }
            },

            frame = ws_rx.next() => {
                let frame = match frame {
                    Some(Ok(f)) => f,
                    Some(Err(e)) => break SignalingError::ConnectionReset(e.to_string()),
                    None => break SignalingError::ConnectionReset("relay closed the connection".to_string()),
                };

                match frame {
                    Message::Text(text) => match decode_relay_frame(text.as_str()) {
                        Ok(message) => {
                            debug!("Received {} message from relay", message.kind());
                            emit(ChannelEventKind::Message(message));
                        }
                        Err(e) => warn!("Dropping malformed relay frame: {}", e),
                    },
                    Message::Pong(_) => {
                        waiting_for_pong = false;
                        pong_deadline = None;
                        debug!("Pong received from relay");
                    }
                    Message::Close(_) => {
                        break SignalingError::ConnectionReset("close received from relay".to_string());
                    }
                    _ => {}
                }
            }
        }
    };

    warn!(
        "Signaling channel for room {} dropped: {}",
        endpoint.room_id, reason
    );
    emit(ChannelEventKind::Dropped(reason));
}

async fn connect_and_register(
    endpoint: &SignalingEndpoint,
    timeout: Duration,
) -> Result<RelaySocket, SignalingError> {
    let connect = tokio_tungstenite::connect_async(endpoint.wss_url.as_str());
    let (mut socket, _response) = match tokio::time::timeout(timeout, connect).await {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => return Err(connect_error(e)),
        Err(_) => {
            return Err(SignalingError::ConnectionRefused(
                "relay connect timed out".to_string(),
            ));
        }
    };

    let register = encode_register(&endpoint.room_id, &endpoint.client_id)?;
    socket
        .send(Message::Text(register.into()))
        .await
        .map_err(|e| SignalingError::RegistrationFailed(e.to_string()))?;

    Ok(socket)
}

fn connect_error(err: tungstenite::Error) -> SignalingError {
    match err {
        tungstenite::Error::Io(e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            SignalingError::ConnectionRefused(e.to_string())
        }
        tungstenite::Error::Io(e) => SignalingError::ConnectionReset(e.to_string()),
        other => SignalingError::RegistrationFailed(other.to_string()),
    }
}

/// Socket errors only; a message that fails to encode is logged and skipped.
async fn send_message(ws_tx: &mut RelaySink, message: &SignalingMessage) -> Result<(), SignalingError> {
    let text = match encode_send(message) {
        Ok(text) => text,
        Err(e) => {
            warn!("Dropping unencodable {} message: {}", message.kind(), e);
            return Ok(());
        }
    };

    ws_tx
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| SignalingError::ConnectionReset(e.to_string()))?;
    debug!("Sent {} message to relay", message.kind());
    Ok(())
}

async fn deregister(endpoint: &SignalingEndpoint) {
    let Some(url) = endpoint.deregistration_url() else {
        return;
    };

    match reqwest::Client::new()
        .delete(url)
        .timeout(DEREGISTER_TIMEOUT)
        .send()
        .await
    {
        Ok(response) => debug!("Relay deregistration returned {}", response.status()),
        Err(e) => debug!("Relay deregistration failed: {}", e),
    }
}
