//! In-process fakes for the relay, the room server and the media engine.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::media::{
    CapturerHandle, EngineError, IceCandidate, IceConnectionState, IceServerSet, MediaConstraints, MediaEngine,
    MediaTrack, PeerConnectionConfig, PeerTransport, SdpType, SessionDescription, StatsReport, TrackKind,
    TransportEvent, TransportEvents,
};
use crate::negotiation::{JoinRequest, NegotiationError, RoomNegotiator, RoomParameters};
use crate::signaling::{ClientId, RoomId, SignalingMessage};

const WAIT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(10);

/// Awaits `future`, failing the test if it takes longer than a few seconds.
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out waiting")
}

async fn poll_until(mut done: impl FnMut() -> bool) {
    within(async {
        while !done() {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayFrame {
    Text(String),
    Closed,
}

enum RelayControl {
    Send(String),
    Drop,
}

/// How the relay treats connections it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServeMode {
    Normal,
    /// Never reads, so pings go unanswered.
    Silent,
    /// Closes right after the first frame from the client.
    DropAfterFirstFrame,
}

/// WebSocket relay on a loopback port. Frames from every client connection
/// land in one queue; pushes go to the most recent connection.
pub struct FakeRelay {
    addr: SocketAddr,
    frames: mpsc::UnboundedReceiver<RelayFrame>,
    control: Arc<Mutex<Option<mpsc::UnboundedSender<RelayControl>>>>,
    connections: Arc<AtomicUsize>,
    mode: Arc<Mutex<ServeMode>>,
    accept_task: JoinHandle<()>,
}

impl FakeRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (frames_tx, frames) = mpsc::unbounded_channel();
        let control = Arc::new(Mutex::new(None));
        let connections = Arc::new(AtomicUsize::new(0));
        let mode = Arc::new(Mutex::new(ServeMode::Normal));

        let accept_task = {
            let control = control.clone();
            let connections = connections.clone();
            let mode = mode.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    connections.fetch_add(1, Ordering::SeqCst);
                    let (control_tx, control_rx) = mpsc::unbounded_channel();
                    *control.lock().unwrap() = Some(control_tx);
                    let mode = *mode.lock().unwrap();
                    tokio::spawn(serve_connection(stream, frames_tx.clone(), control_rx, mode));
                }
            })
        };

        Self {
            addr,
            frames,
            control,
            connections,
            mode,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub async fn next_frame(&mut self) -> RelayFrame {
        within(self.frames.recv()).await.expect("relay frame")
    }

    /// Frames already received, without waiting.
    pub fn received(&mut self) -> Vec<RelayFrame> {
        std::iter::from_fn(|| self.frames.try_recv().ok()).collect()
    }

    pub async fn next_json(&mut self) -> serde_json::Value {
        match self.next_frame().await {
            RelayFrame::Text(text) => serde_json::from_str(&text).unwrap(),
            RelayFrame::Closed => panic!("Expected a text frame, connection closed"),
        }
    }

    /// Next `send` command, decoded to the message it carries.
    pub async fn next_payload(&mut self) -> SignalingMessage {
        let json = self.next_json().await;
        assert_eq!(json["cmd"], "send", "unexpected relay command: {}", json);
        SignalingMessage::parse(json["msg"].as_str().unwrap()).unwrap()
    }

    /// Payloads sent until the client closes its connection.
    pub async fn payloads_until_closed(&mut self) -> Vec<SignalingMessage> {
        let mut payloads = Vec::new();
        while let RelayFrame::Text(text) = self.next_frame().await {
            let json: serde_json::Value = serde_json::from_str(&text).unwrap();
            if json["cmd"] == "send" {
                payloads.push(SignalingMessage::parse(json["msg"].as_str().unwrap()).unwrap());
            }
        }
        payloads
    }

    pub fn push(&self, message: &SignalingMessage) {
        let frame = serde_json::json!({
            "msg": message.to_json().unwrap(),
            "error": "",
        });
        self.push_raw(&frame.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        self.control(RelayControl::Send(text.to_string()));
    }

    /// Closes the latest connection from the relay side.
    pub fn drop_connection(&self) {
        self.control(RelayControl::Drop);
    }

    /// Connections accepted after this never read, so pings go unanswered.
    pub fn ignore_pings(&self) {
        *self.mode.lock().unwrap() = ServeMode::Silent;
    }

    /// Connections accepted after this close as soon as the client registers.
    pub fn drop_after_register(&self) {
        *self.mode.lock().unwrap() = ServeMode::DropAfterFirstFrame;
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Stops accepting; later connects are refused.
    pub fn shutdown(&self) {
        self.accept_task.abort();
    }

    fn control(&self, command: RelayControl) {
        let guard = self.control.lock().unwrap();
        let tx = guard.as_ref().expect("no relay connection yet");
        let _ = tx.send(command);
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_connection(
    stream: TcpStream,
    frames: mpsc::UnboundedSender<RelayFrame>,
    mut control: mpsc::UnboundedReceiver<RelayControl>,
    mode: ServeMode,
) {
    let Ok(ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = ws.split();

    if mode == ServeMode::Silent {
        while let Some(command) = control.recv().await {
            if matches!(command, RelayControl::Drop) {
                break;
            }
        }
        return;
    }

    loop {
        tokio::select! {
            frame = ws_rx.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let _ = frames.send(RelayFrame::Text(text.as_str().to_string()));
                    if mode == ServeMode::DropAfterFirstFrame {
                        let _ = ws_tx.send(Message::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                    let _ = frames.send(RelayFrame::Closed);
                    break;
                }
                Some(Ok(_)) => {}
            },

            command = control.recv() => match command {
                Some(RelayControl::Send(text)) => {
                    if ws_tx.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(RelayControl::Drop) | None => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportCall {
    AddTrack(TrackKind),
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpType),
    SetRemote(SdpType),
    AddCandidate(String),
    RemoveCandidates(usize),
    MaxBitrate(u32),
}

/// Peer transport that records calls and lets tests inject events.
pub struct FakeTransport {
    events: TransportEvents,
    calls: Mutex<Vec<TransportCall>>,
    closed: AtomicBool,
    stats_requests: AtomicUsize,
}

impl FakeTransport {
    fn new(events: TransportEvents) -> Self {
        Self {
            events,
            calls: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            stats_requests: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn ice(&self, state: IceConnectionState) {
        self.emit(TransportEvent::IceConnectionChanged(state));
    }

    pub fn calls(&self) -> Vec<TransportCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats_requests(&self) -> usize {
        self.stats_requests.load(Ordering::SeqCst)
    }

    pub async fn wait_for_call(&self, call: TransportCall) {
        poll_until(|| self.calls().contains(&call)).await
    }

    pub async fn wait_until_closed(&self) {
        poll_until(|| self.is_closed()).await
    }

    fn record(&self, call: TransportCall) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn add_track(&self, track: &MediaTrack) -> Result<(), EngineError> {
        self.record(TransportCall::AddTrack(track.kind()));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(TransportCall::CreateOffer);
        Ok(SessionDescription {
            sdp_type: SdpType::Offer,
            sdp: "fake-offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription, EngineError> {
        self.record(TransportCall::CreateAnswer);
        Ok(SessionDescription {
            sdp_type: SdpType::Answer,
            sdp: "fake-answer".to_string(),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(TransportCall::SetLocal(description.sdp_type));
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<(), EngineError> {
        self.record(TransportCall::SetRemote(description.sdp_type));
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), EngineError> {
        self.record(TransportCall::AddCandidate(candidate.candidate));
        Ok(())
    }

    async fn remove_ice_candidates(&self, candidates: Vec<IceCandidate>) -> Result<(), EngineError> {
        self.record(TransportCall::RemoveCandidates(candidates.len()));
        Ok(())
    }

    async fn set_max_bitrate(&self, bps: u32) -> Result<(), EngineError> {
        self.record(TransportCall::MaxBitrate(bps));
        Ok(())
    }

    async fn stats(&self) -> Result<Vec<StatsReport>, EngineError> {
        let n = self.stats_requests.fetch_add(1, Ordering::SeqCst);
        Ok(vec![StatsReport {
            id: format!("report-{}", n),
            kind: "transport".to_string(),
            timestamp_us: n as f64,
            values: Default::default(),
        }])
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct EngineRecord {
    transports: Vec<Arc<FakeTransport>>,
    audio_tracks: usize,
    video_tracks: usize,
    camera_constraints: Vec<MediaConstraints>,
    ice_servers: Vec<IceServerSet>,
    audio_session: Vec<bool>,
}

/// Media engine producing in-memory tracks and recording transports.
#[derive(Default)]
pub struct FakeEngine {
    record: Mutex<EngineRecord>,
    fail_capture: bool,
}

impl FakeEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing_capture() -> Arc<Self> {
        Arc::new(Self {
            fail_capture: true,
            ..Self::default()
        })
    }

    /// (audio, video) tracks created so far.
    pub fn tracks_created(&self) -> (usize, usize) {
        let record = self.record.lock().unwrap();
        (record.audio_tracks, record.video_tracks)
    }

    pub fn camera_constraints(&self) -> Vec<MediaConstraints> {
        self.record.lock().unwrap().camera_constraints.clone()
    }

    pub fn ice_servers(&self) -> Vec<IceServerSet> {
        self.record.lock().unwrap().ice_servers.clone()
    }

    pub fn audio_session(&self) -> Vec<bool> {
        self.record.lock().unwrap().audio_session.clone()
    }

    pub fn transport_count(&self) -> usize {
        self.record.lock().unwrap().transports.len()
    }

    pub fn last_transport(&self) -> Option<Arc<FakeTransport>> {
        self.record.lock().unwrap().transports.last().cloned()
    }

    pub async fn wait_for_transport(&self) -> Arc<FakeTransport> {
        poll_until(|| self.last_transport().is_some()).await;
        self.last_transport().unwrap()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_peer_connection(
        &self,
        config: PeerConnectionConfig,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>, EngineError> {
        let transport = Arc::new(FakeTransport::new(events));
        let mut record = self.record.lock().unwrap();
        record.ice_servers.push(config.ice_servers);
        record.transports.push(transport.clone());
        let transport: Arc<dyn PeerTransport> = transport;
        Ok(transport)
    }

    async fn create_audio_track(&self, _constraints: &MediaConstraints) -> Result<MediaTrack, EngineError> {
        let mut record = self.record.lock().unwrap();
        record.audio_tracks += 1;
        Ok(MediaTrack::new(format!("audio-{}", record.audio_tracks), TrackKind::Audio))
    }

    async fn create_video_track(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<(MediaTrack, CapturerHandle), EngineError> {
        if self.fail_capture {
            return Err(EngineError::CaptureUnavailable("no camera".to_string()));
        }
        let mut record = self.record.lock().unwrap();
        record.video_tracks += 1;
        record.camera_constraints.push(constraints.clone());
        let track = MediaTrack::new(format!("video-{}", record.video_tracks), TrackKind::Video);
        let capturer = CapturerHandle {
            device_id: "front".to_string(),
        };
        Ok((track, capturer))
    }

    async fn switch_camera(&self, capturer: &CapturerHandle) -> Result<CapturerHandle, EngineError> {
        let device_id = if capturer.device_id == "front" { "back" } else { "front" };
        Ok(CapturerHandle {
            device_id: device_id.to_string(),
        })
    }

    fn set_audio_session_active(&self, active: bool) {
        self.record.lock().unwrap().audio_session.push(active);
    }
}

/// Room server stand-in with a canned join outcome.
pub struct FakeNegotiator {
    outcome: Result<RoomParameters, NegotiationError>,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    last_join: Mutex<Option<JoinRequest>>,
}

impl FakeNegotiator {
    pub fn joining(params: RoomParameters) -> Arc<Self> {
        Self::with_outcome(Ok(params))
    }

    pub fn failing(error: NegotiationError) -> Arc<Self> {
        Self::with_outcome(Err(error))
    }

    fn with_outcome(outcome: Result<RoomParameters, NegotiationError>) -> Arc<Self> {
        Arc::new(Self {
            outcome,
            joins: AtomicUsize::new(0),
            leaves: AtomicUsize::new(0),
            last_join: Mutex::new(None),
        })
    }

    pub fn joins(&self) -> usize {
        self.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.leaves.load(Ordering::SeqCst)
    }

    pub fn last_join(&self) -> Option<JoinRequest> {
        self.last_join.lock().unwrap().clone()
    }

    pub async fn wait_for_leaves(&self, count: usize) {
        poll_until(|| self.leaves() >= count).await
    }
}

#[async_trait]
impl RoomNegotiator for FakeNegotiator {
    async fn join(&self, request: &JoinRequest) -> Result<RoomParameters, NegotiationError> {
        self.joins.fetch_add(1, Ordering::SeqCst);
        *self.last_join.lock().unwrap() = Some(request.clone());
        self.outcome.clone()
    }

    async fn leave(
        &self,
        _server_host: &Url,
        _room_id: &RoomId,
        _client_id: &ClientId,
    ) -> Result<(), NegotiationError> {
        self.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Join outcome pointing the client at `relay_url`.
pub fn room_params(relay_url: &str, initiator: bool) -> RoomParameters {
    RoomParameters {
        client_id: Some(ClientId::from("12345678")),
        is_initiator: initiator,
        ice_servers: IceServerSet::default(),
        wss_url: Some(Url::parse(relay_url).unwrap()),
        wss_post_url: None,
        messages: Vec::new(),
    }
}
