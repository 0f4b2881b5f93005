use std::error::Error;

use tokio::sync::mpsc;
use tracing::{info, warn};
use url::Url;

use roomlink::ClientConfig;
use roomlink::negotiation::{HttpRoomNegotiator, JoinRequest, RoomNegotiator};
use roomlink::signaling::{ChannelEventKind, ClientId, RoomId, SignalingChannel, SignalingEndpoint};

/// Joins a room, registers with its relay and logs inbound signaling until
/// Ctrl+C. Tunables are read from the JSON file named by `ROOMLINK_CONFIG`.
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let (Some(host), Some(room)) = (args.next(), args.next()) else {
        eprintln!("usage: roomlink <server-host-url> <room-id>");
        std::process::exit(2);
    };

    let config = match std::env::var("ROOMLINK_CONFIG") {
        Ok(path) => ClientConfig::from_json(&std::fs::read_to_string(path)?)?,
        Err(_) => ClientConfig::default(),
    };

    let server_host = Url::parse(&host)?;
    let room_id = RoomId::from(room);
    let negotiator = HttpRoomNegotiator::new(&config)?;
    let params = negotiator
        .join(&JoinRequest {
            server_host: server_host.clone(),
            room_id: room_id.clone(),
            loopback: false,
        })
        .await?;

    let client_id = params.client_id.unwrap_or_else(ClientId::generate);
    let wss_url = params.wss_url.ok_or("room server sent no relay url")?;
    println!("   Joined room {} as {}", room_id, client_id);
    println!("   Initiator: {}", params.is_initiator);
    println!("   Relay: {}", wss_url);
    println!("   Press Ctrl+C to leave\n");

    for message in &params.messages {
        info!("Queued in room: {}", message.kind());
    }

    let (events_tx, mut events) = mpsc::unbounded_channel();
    let endpoint = SignalingEndpoint {
        wss_url,
        rest_url: params.wss_post_url,
        room_id: room_id.clone(),
        client_id: client_id.clone(),
    };
    let channel = SignalingChannel::open(endpoint, &config, 1, events_tx);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event.map(|e| e.kind) {
                Some(ChannelEventKind::Registered) => info!("Registered with relay"),
                Some(ChannelEventKind::Message(message)) => info!("Relay message: {:?}", message),
                Some(ChannelEventKind::RegistrationFailed(e)) | Some(ChannelEventKind::Dropped(e)) => {
                    warn!("Relay unavailable: {}", e);
                    break;
                }
                None => break,
            },
        }
    }

    channel.shutdown().await;
    if let Err(e) = negotiator.leave(&server_host, &room_id, &client_id).await {
        warn!("Leave failed: {}", e);
    }
    Ok(())
}
