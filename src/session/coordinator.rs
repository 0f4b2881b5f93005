use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use url::Url;

use super::observer::{CallEvent, CallObserver, ObserverSink};
use super::settings::ConnectRequest;
use super::state::{ConnectionState, StateMachine};
use crate::config::ClientConfig;
use crate::error::CallError;
use crate::media::{
    EngineError, IceCandidate, IceConnectionState, IceServer, IceServerSet, LocalTracks, MediaConstraints,
    MediaController, MediaEngine, PeerConnectionConfig, SdpType, SessionDescription, StatsReport, TrackKind,
    TrackRequest, TransportEvent, WeakTrack,
};
use crate::negotiation::{JoinRequest, NegotiationError, RoomNegotiator, RoomParameters};
use crate::signaling::{
    ChannelEvent, ChannelEventKind, ClientId, RoomId, SignalingChannel, SignalingEndpoint, SignalingError,
    SignalingMessage,
};

/// Commands sent to the coordinator actor
pub(crate) enum Command {
    Connect {
        request: Box<ConnectRequest>,
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    Disconnect {
        without_bye: bool,
    },
    /// Disconnect, then stop the actor.
    Release,
    /// Connect again with the last accepted request.
    Reconnect {
        reply: oneshot::Sender<Result<(), CallError>>,
    },
    SendBye,
    CallUp,
    SetMuted {
        kind: TrackKind,
        muted: bool,
    },
    CreateLocalVideo,
    SetUpMediaSender,
    SwitchCamera,
    SetAudioOnly(bool),
    RegisterWithRelay,
    SetAudioSessionActive(bool),
    SetMaxBitrate(u32),
    SetCameraConstraints(MediaConstraints),
    SetStatsEnabled(bool),
    State {
        reply: oneshot::Sender<ConnectionState>,
    },
}

/// Completions marshalled back onto the coordinator, tagged with the
/// generation that started them.
pub(crate) enum Internal {
    Negotiated {
        generation: u64,
        request: JoinRequest,
        result: Result<RoomParameters, NegotiationError>,
    },
    TracksCreated {
        generation: u64,
        initial: bool,
        result: Result<LocalTracks, EngineError>,
    },
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    StatsReady {
        generation: u64,
        result: Result<Vec<StatsReport>, EngineError>,
    },
    ReregisterDue {
        generation: u64,
    },
}

pub(crate) struct Inbox {
    internal: mpsc::UnboundedReceiver<Internal>,
    signaling: mpsc::UnboundedReceiver<ChannelEvent>,
}

/// One call attempt, from connect until teardown.
struct Session {
    generation: u64,
    room_id: RoomId,
    server_host: Url,
    use_media_server: bool,
    stats_enabled: bool,
    client_id_override: Option<ClientId>,
    wss_override: Option<Url>,
    rest_override: Option<Url>,
    turn: Option<IceServer>,
    /// Client id the room server knows us by; set once negotiation succeeds.
    joined: Option<ClientId>,
    initiator: bool,
    endpoint: Option<SignalingEndpoint>,
    channel: Option<SignalingChannel>,
    channel_tag: u64,
    registered: bool,
    registered_at: Option<Instant>,
    unsent: Vec<SignalingMessage>,
    reregister_attempts: u32,
    ice_state: IceConnectionState,
    published: bool,
    announced: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    deferred: Vec<SignalingMessage>,
    remote_video: Option<WeakTrack>,
    forwarder: Option<JoinHandle<()>>,
    stats_task: Option<JoinHandle<()>>,
}

impl Session {
    fn from_request(request: &ConnectRequest, generation: u64) -> Result<Self, CallError> {
        let room_id = request.room_id.trim();
        if room_id.is_empty() {
            return Err(NegotiationError::InvalidUrl("empty room id".to_string()).into());
        }
        let server_host = Url::parse(request.server_host_url.trim())
            .map_err(|e| NegotiationError::InvalidUrl(format!("{}: {}", request.server_host_url, e)))?;
        let wss_override = optional_url(&request.wss_url)?;
        let rest_override = optional_url(&request.websocket_url)?;

        Ok(Self {
            generation,
            room_id: RoomId::from(room_id),
            server_host,
            use_media_server: request.use_media_server,
            stats_enabled: request.settings.stats_enabled,
            client_id_override: request
                .client_id
                .as_deref()
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(ClientId::from),
            wss_override,
            rest_override,
            turn: request.turn.clone().map(IceServer::from),
            joined: None,
            initiator: false,
            endpoint: None,
            channel: None,
            channel_tag: 0,
            registered: false,
            registered_at: None,
            unsent: Vec::new(),
            reregister_attempts: 0,
            ice_state: IceConnectionState::New,
            published: false,
            announced: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            deferred: Vec::new(),
            remote_video: None,
            forwarder: None,
            stats_task: None,
        })
    }

    /// Relay messages go out on the live channel, or wait for the next one.
    fn send(&mut self, message: SignalingMessage) {
        match &self.channel {
            Some(channel) => channel.send(message),
            None => {
                debug!("Relay unavailable, holding outbound {}", message.kind());
                self.unsent.push(message);
            }
        }
    }
}

fn optional_url(raw: &str) -> Result<Option<Url>, SignalingError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    Url::parse(raw)
        .map(Some)
        .map_err(|e| SignalingError::InvalidEndpoint(format!("{}: {}", raw, e)))
}

/// Owns the session state machine. Runs as a single task; every collaborator
/// reports back through `Inbox`.
pub(crate) struct Coordinator {
    config: ClientConfig,
    negotiator: Arc<dyn RoomNegotiator>,
    media: MediaController,
    observer: ObserverSink,
    state: StateMachine,
    generation: u64,
    next_channel_tag: u64,
    session: Option<Session>,
    last_request: Option<ConnectRequest>,
    stats_override: Option<bool>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    signaling_tx: mpsc::UnboundedSender<ChannelEvent>,
}

impl Coordinator {
    pub(crate) fn new(
        config: ClientConfig,
        engine: Arc<dyn MediaEngine>,
        negotiator: Arc<dyn RoomNegotiator>,
        observer: Weak<dyn CallObserver>,
    ) -> (Self, Inbox) {
        let (internal_tx, internal) = mpsc::unbounded_channel();
        let (signaling_tx, signaling) = mpsc::unbounded_channel();

        let coordinator = Self {
            config,
            negotiator,
            media: MediaController::new(engine),
            observer: ObserverSink::new(observer),
            state: StateMachine::new(),
            generation: 0,
            next_channel_tag: 0,
            session: None,
            last_request: None,
            stats_override: None,
            internal_tx,
            signaling_tx,
        };
        (coordinator, Inbox { internal, signaling })
    }

    pub(crate) async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut inbox: Inbox) {
        info!("Call coordinator started");

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Release) | None => {
                        self.release().await;
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                },

                Some(event) = inbox.signaling.recv() => self.handle_signaling(event).await,

                Some(event) = inbox.internal.recv() => self.handle_internal(event).await,
            }
        }

        info!("Call coordinator stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect { request, reply } => {
                let result = self.connect(*request);
                let _ = reply.send(result);
            }
            Command::Disconnect { without_bye } => self.teardown(!without_bye).await,
            Command::Release => self.release().await,
            Command::Reconnect { reply } => {
                let result = self.reconnect();
                let _ = reply.send(result);
            }
            Command::SendBye => self.send_bye(),
            Command::CallUp => self.call_up().await,
            Command::SetMuted { kind, muted } => self.media.set_muted(kind, muted),
            Command::CreateLocalVideo => self.request_late_tracks(self.media.video_request(), "video"),
            Command::SetUpMediaSender => self.request_late_tracks(self.media.track_request(), "media sender"),
            Command::SwitchCamera => self.switch_camera().await,
            Command::SetAudioOnly(audio_only) => self.media.set_audio_only(audio_only),
            Command::RegisterWithRelay => self.register_with_relay_if_ready(),
            Command::SetAudioSessionActive(active) => self.media.set_audio_session_active(active),
            Command::SetMaxBitrate(kbps) => self.media.set_max_bitrate(kbps).await,
            Command::SetCameraConstraints(constraints) => self.media.set_camera_constraints(constraints),
            Command::SetStatsEnabled(enabled) => self.set_stats_enabled(enabled),
            Command::State { reply } => {
                let _ = reply.send(self.state.current());
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        match event {
            Internal::Negotiated {
                generation,
                request,
                result,
            } => self.on_negotiated(generation, request, result).await,
            Internal::TracksCreated {
                generation,
                initial,
                result,
            } => self.on_tracks_created(generation, initial, result).await,
            Internal::Transport { generation, event } => self.on_transport_event(generation, event).await,
            Internal::StatsReady { generation, result } => self.on_stats(generation, result),
            Internal::ReregisterDue { generation } => self.on_reregister_due(generation),
        }
    }

    fn connect(&mut self, request: ConnectRequest) -> Result<(), CallError> {
        let current = self.state.current();
        if current != ConnectionState::Disconnected {
            warn!("Connect to room {} rejected: already {}", request.room_id, current);
            return Err(self.reject(CallError::AlreadyConnected(current)));
        }

        let session = match Session::from_request(&request, self.generation + 1) {
            Ok(session) => session,
            Err(e) => {
                warn!("Connect to room {} rejected: {}", request.room_id, e);
                return Err(self.reject(e));
            }
        };

        self.state.transition(ConnectionState::Connecting)?;
        self.last_request = Some(request.clone());
        self.generation = session.generation;
        self.media.prepare(
            request.audio_only,
            request.settings.max_bitrate_kbps,
            request.settings.camera_constraints.clone(),
        );

        let join = JoinRequest {
            server_host: session.server_host.clone(),
            room_id: session.room_id.clone(),
            loopback: request.settings.loopback,
        };
        info!(
            "Connecting to room {} (generation {})",
            session.room_id, session.generation
        );
        self.session = Some(session);

        let negotiator = self.negotiator.clone();
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = negotiator.join(&join).await;
            let _ = tx.send(Internal::Negotiated {
                generation,
                request: join,
                result,
            });
        });
        Ok(())
    }

    /// Only acts from Disconnected; an ongoing call is left alone.
    fn reconnect(&mut self) -> Result<(), CallError> {
        let current = self.state.current();
        if current != ConnectionState::Disconnected {
            debug!("Reconnect ignored while {}", current);
            return Ok(());
        }
        let Some(request) = self.last_request.clone() else {
            return Err(self.reject(CallError::NoPreviousCall));
        };
        info!("Reconnecting to room {}", request.room_id);
        self.connect(request)
    }

    fn reject(&self, error: CallError) -> CallError {
        self.observer.emit(CallEvent::Error(error.clone()));
        error
    }

    async fn on_negotiated(
        &mut self,
        generation: u64,
        request: JoinRequest,
        result: Result<RoomParameters, NegotiationError>,
    ) {
        if generation != self.generation || self.session.is_none() {
            debug!("Discarding negotiation result from stale generation {}", generation);
            if let Ok(RoomParameters {
                client_id: Some(client_id),
                ..
            }) = result
            {
                self.spawn_leave(request.server_host, request.room_id, client_id);
            }
            return;
        }

        let params = match result {
            Ok(params) => params,
            Err(e) => {
                warn!("Room negotiation for {} failed: {}", request.room_id, e);
                self.fail(CallError::NegotiationFailed(e), false).await;
                return;
            }
        };

        let Some(session) = self.session.as_mut() else {
            return;
        };
        let client_id = session
            .client_id_override
            .clone()
            .or(params.client_id)
            .unwrap_or_else(ClientId::generate);
        session.joined = Some(client_id.clone());
        session.initiator = params.is_initiator || session.use_media_server;
        session.deferred.extend(params.messages);

        let Some(wss_url) = session.wss_override.clone().or(params.wss_url) else {
            let reason = SignalingError::InvalidEndpoint("no relay url from caller or room server".to_string());
            self.fail(reason.into(), false).await;
            return;
        };
        session.endpoint = Some(SignalingEndpoint {
            wss_url,
            rest_url: session.rest_override.clone().or(params.wss_post_url),
            room_id: session.room_id.clone(),
            client_id,
        });
        let ice_servers = IceServerSet::resolve(params.ice_servers, session.turn.clone());
        info!(
            "Room {} negotiated (initiator: {}, {} ICE server(s))",
            session.room_id,
            session.initiator,
            ice_servers.len()
        );

        self.open_channel();

        let (transport_tx, mut transport_rx) = mpsc::unbounded_channel();
        let config = PeerConnectionConfig {
            ice_servers,
            constraints: MediaConstraints::default(),
        };
        let transport = match self.media.engine().create_peer_connection(config, transport_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("Peer connection setup failed: {}", e);
                self.fail(CallError::transport(e), true).await;
                return;
            }
        };
        self.media.attach_transport(transport);

        let internal = self.internal_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = transport_rx.recv().await {
                if internal.send(Internal::Transport { generation, event }).is_err() {
                    break;
                }
            }
        });
        if let Some(session) = self.session.as_mut() {
            session.forwarder = Some(forwarder);
        }

        self.request_tracks(self.media.track_request(), true);
    }

    fn open_channel(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(endpoint) = session.endpoint.clone() else {
            return;
        };

        self.next_channel_tag += 1;
        let channel = SignalingChannel::open(endpoint, &self.config, self.next_channel_tag, self.signaling_tx.clone());
        for message in session.unsent.drain(..) {
            channel.send(message);
        }
        session.channel = Some(channel);
        session.channel_tag = self.next_channel_tag;
        session.registered = false;
        session.registered_at = None;
    }

    fn request_tracks(&self, request: TrackRequest, initial: bool) {
        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            let result = request.create().await;
            let _ = tx.send(Internal::TracksCreated {
                generation,
                initial,
                result,
            });
        });
    }

    /// Tracks asked for outside the connect sequence. Only a published
    /// session takes them; otherwise the request is dropped.
    fn request_late_tracks(&self, request: TrackRequest, what: &str) {
        match self.session.as_ref() {
            None => {
                debug!("Local {} request ignored with no call", what);
                return;
            }
            Some(session) if !session.published => {
                debug!("Local {} request ignored while the session sets up media", what);
                return;
            }
            Some(_) => {}
        }
        if request.is_empty() {
            debug!("Local {} already exists", what);
            return;
        }
        self.request_tracks(request, false);
    }

    async fn on_tracks_created(&mut self, generation: u64, initial: bool, result: Result<LocalTracks, EngineError>) {
        if generation != self.generation {
            debug!("Discarding local tracks from stale generation {}", generation);
            return;
        }
        if self.session.is_none() {
            return;
        }

        let tracks = match result {
            Ok(tracks) => tracks,
            Err(e) if initial => {
                error!("Local media unavailable: {}", e);
                self.fail(CallError::media(e), true).await;
                return;
            }
            Err(e) => {
                warn!("Local track creation failed: {}", e);
                self.observer.emit(CallEvent::Error(CallError::media(e)));
                return;
            }
        };

        let new_audio = tracks.audio.is_some();
        let new_video = tracks.video.is_some();
        let new_capturer = tracks.capturer.is_some();
        self.media.install(tracks);

        if new_capturer {
            if let Some(capturer) = self.media.capturer() {
                self.observer.emit(CallEvent::LocalCapturer(capturer.clone()));
            }
        }
        if new_video || initial {
            if let Some(video) = self.media.local_video() {
                self.observer.emit(CallEvent::LocalVideoTrack(video.clone()));
            }
        }

        if initial {
            self.publish_session().await;
            return;
        }

        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.published {
            return;
        }
        let initiator = session.initiator;
        for (added, kind) in [(new_audio, TrackKind::Audio), (new_video, TrackKind::Video)] {
            if added {
                if let Err(e) = self.media.publish_track(kind).await {
                    warn!("Failed to add local {} track: {}", kind, e);
                }
            }
        }
        if initiator && (new_audio || new_video) {
            self.send_offer().await;
        }
    }

    /// Local tracks exist and the transport is up: add the tracks, make the
    /// first offer if we initiate, then replay signaling that arrived early.
    async fn publish_session(&mut self) {
        self.announce_connecting();

        if let Err(e) = self.media.publish().await {
            error!("Failed to publish local media: {}", e);
            self.fail(CallError::transport(e), true).await;
            return;
        }

        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.published = true;
        let initiator = session.initiator;
        let deferred = std::mem::take(&mut session.deferred);
        let stats = self.stats_override.unwrap_or(session.stats_enabled);
        info!("Local media published for room {}", session.room_id);

        if initiator {
            self.send_offer().await;
        }
        for message in deferred {
            if self.session.is_none() {
                break;
            }
            self.dispatch_signaling(message).await;
        }

        if stats {
            self.start_stats();
        }
        self.maybe_connected();
    }

    fn announce_connecting(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.announced {
            return;
        }
        session.announced = true;
        self.observer
            .emit(CallEvent::StateChanged(ConnectionState::Connecting));
    }

    fn maybe_connected(&mut self) {
        if self.state.current() != ConnectionState::Connecting {
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if !session.registered || !session.published || !session.ice_state.is_usable() {
            return;
        }

        self.announce_connecting();
        if let Err(e) = self.state.transition(ConnectionState::Connected) {
            warn!("{}", e);
            return;
        }
        if let Some(session) = self.session.as_ref() {
            info!("Connected to room {}", session.room_id);
        }
        self.observer
            .emit(CallEvent::StateChanged(ConnectionState::Connected));
    }

    async fn handle_signaling(&mut self, event: ChannelEvent) {
        let Some(session) = self.session.as_mut() else {
            debug!("Discarding signaling event from channel {} with no session", event.tag);
            return;
        };
        if event.tag != session.channel_tag || session.channel.is_none() {
            debug!("Discarding signaling event from stale channel {}", event.tag);
            return;
        }

        match event.kind {
            ChannelEventKind::Registered => {
                session.registered = true;
                session.registered_at = Some(Instant::now());
                info!("Relay registration complete for room {}", session.room_id);
                self.maybe_connected();
            }
            ChannelEventKind::Message(message) => {
                // The relay delivered traffic, so this registration is a working one.
                session.reregister_attempts = 0;
                self.on_signaling_message(message).await
            }
            ChannelEventKind::RegistrationFailed(reason) | ChannelEventKind::Dropped(reason) => {
                self.on_signaling_lost(reason).await
            }
        }
    }

    async fn on_signaling_message(&mut self, message: SignalingMessage) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let urgent = matches!(message, SignalingMessage::Bye | SignalingMessage::Error { .. });
        if !session.published && !urgent {
            debug!("Deferring inbound {} until local media is published", message.kind());
            session.deferred.push(message);
            return;
        }
        self.dispatch_signaling(message).await;
    }

    async fn dispatch_signaling(&mut self, message: SignalingMessage) {
        debug!("Handling inbound {} message", message.kind());

        match message {
            SignalingMessage::Offer { sdp } => self.on_remote_offer(sdp).await,
            SignalingMessage::Answer { sdp } => {
                let answer = SessionDescription {
                    sdp_type: SdpType::Answer,
                    sdp,
                };
                self.apply_remote_description(answer).await;
            }
            SignalingMessage::Candidate(payload) => self.on_remote_candidate(payload.into()).await,
            SignalingMessage::RemoveCandidates { candidates } => {
                let candidates = candidates.into_iter().map(IceCandidate::from).collect();
                self.on_remote_candidates_removed(candidates).await;
            }
            SignalingMessage::Bye => {
                info!("Remote peer left the room");
                self.observer.emit(CallEvent::NeedLeave);
                self.teardown(false).await;
            }
            SignalingMessage::Error { message } => {
                warn!("Relay reported an error: {}", message);
                self.observer.emit(CallEvent::CallDoctor);
            }
        }
    }

    /// Returns false when the description was rejected and the session torn down.
    async fn apply_remote_description(&mut self, description: SessionDescription) -> bool {
        let Some(transport) = self.media.transport() else {
            return false;
        };
        if let Err(e) = transport.set_remote_description(description).await {
            error!("Remote description rejected: {}", e);
            self.fail(CallError::transport(e), true).await;
            return false;
        }

        let Some(session) = self.session.as_mut() else {
            return false;
        };
        session.remote_description_set = true;
        let pending = std::mem::take(&mut session.pending_candidates);
        if !pending.is_empty() {
            debug!("Applying {} buffered remote candidate(s)", pending.len());
        }
        for candidate in pending {
            if let Err(e) = transport.add_ice_candidate(candidate).await {
                warn!("Buffered remote candidate rejected: {}", e);
            }
        }
        true
    }

    async fn on_remote_offer(&mut self, sdp: String) {
        let offer = SessionDescription {
            sdp_type: SdpType::Offer,
            sdp,
        };
        if !self.apply_remote_description(offer).await {
            return;
        }
        let Some(transport) = self.media.transport() else {
            return;
        };

        let answer = match transport.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                error!("Answer creation failed: {}", e);
                self.fail(CallError::transport(e), true).await;
                return;
            }
        };
        if let Err(e) = transport.set_local_description(answer.clone()).await {
            error!("Local answer rejected: {}", e);
            self.fail(CallError::transport(e), true).await;
            return;
        }
        self.send_signaling(SignalingMessage::description(answer));
    }

    async fn send_offer(&mut self) {
        let Some(transport) = self.media.transport() else {
            return;
        };

        let offer = match transport.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                error!("Offer creation failed: {}", e);
                self.fail(CallError::transport(e), true).await;
                return;
            }
        };
        if let Err(e) = transport.set_local_description(offer.clone()).await {
            error!("Local offer rejected: {}", e);
            self.fail(CallError::transport(e), true).await;
            return;
        }
        debug!("Sending offer");
        self.send_signaling(SignalingMessage::description(offer));
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.remote_description_set {
            session.pending_candidates.push(candidate);
            return;
        }
        let Some(transport) = self.media.transport() else {
            return;
        };
        if let Err(e) = transport.add_ice_candidate(candidate).await {
            warn!("Remote candidate rejected: {}", e);
        }
    }

    async fn on_remote_candidates_removed(&mut self, candidates: Vec<IceCandidate>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if !session.remote_description_set {
            session.pending_candidates.retain(|c| !candidates.contains(c));
            return;
        }
        let Some(transport) = self.media.transport() else {
            return;
        };
        if let Err(e) = transport.remove_ice_candidates(candidates).await {
            warn!("Remote candidate removal failed: {}", e);
        }
    }

    fn send_signaling(&mut self, message: SignalingMessage) {
        match self.session.as_mut() {
            Some(session) => session.send(message),
            None => debug!("No session, dropping outbound {}", message.kind()),
        }
    }

    async fn on_signaling_lost(&mut self, reason: SignalingError) {
        let state = self.state.current();
        let max_attempts = self.config.max_reregister_attempts;
        let stable_after = self.config.ping_interval();
        let Some(session) = self.session.as_mut() else {
            return;
        };
        session.channel = None;
        session.registered = false;
        // A registration that survived a keepalive cycle earns a fresh budget.
        if session
            .registered_at
            .take()
            .is_some_and(|at| at.elapsed() >= stable_after)
        {
            session.reregister_attempts = 0;
        }

        if state != ConnectionState::Connected {
            error!(
                "Relay unavailable while connecting to room {}: {}",
                session.room_id, reason
            );
            self.fail(CallError::SignalingUnavailable(reason), false).await;
            return;
        }

        if session.reregister_attempts >= max_attempts {
            error!(
                "Relay for room {} still unavailable after {} attempt(s): {}",
                session.room_id, session.reregister_attempts, reason
            );
            self.observer.emit(CallEvent::ReconnectNeeded);
            self.observer
                .emit(CallEvent::Error(CallError::SignalingUnavailable(reason)));
            return;
        }

        session.reregister_attempts += 1;
        let attempt = session.reregister_attempts;
        let delay = self.config.reregister_backoff(attempt);
        warn!(
            "Relay for room {} lost ({}), re-registering in {:?} (attempt {}/{})",
            session.room_id, reason, delay, attempt, max_attempts
        );
        self.observer.emit(CallEvent::CallDoctor);

        let tx = self.internal_tx.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::ReregisterDue { generation });
        });
    }

    fn on_reregister_due(&mut self, generation: u64) {
        if generation != self.generation {
            debug!("Discarding re-registration for stale generation {}", generation);
            return;
        }
        let Some(session) = self.session.as_ref() else {
            return;
        };
        if session.channel.is_some() {
            return;
        }
        info!("Re-registering with relay for room {}", session.room_id);
        self.open_channel();
    }

    fn register_with_relay_if_ready(&mut self) {
        let Some(session) = self.session.as_mut() else {
            debug!("No session to register with the relay");
            return;
        };
        if session.endpoint.is_none() {
            debug!("Room not negotiated yet, registration follows negotiation");
            return;
        }
        if session.channel.is_some() {
            debug!("Relay channel already open");
            return;
        }
        session.reregister_attempts = 0;
        self.open_channel();
    }

    async fn on_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation || self.session.is_none() {
            debug!("Discarding transport event from stale generation {}", generation);
            return;
        }

        match event {
            TransportEvent::IceConnectionChanged(state) => {
                if let Some(session) = self.session.as_mut() {
                    session.ice_state = state;
                }
                debug!("ICE connection state: {:?}", state);
                self.observer.emit(CallEvent::IceConnectionChanged(state));

                match state {
                    state if state.is_terminal_failure() => {
                        error!("ICE connection failed");
                        let reason = CallError::TransportFailed("ICE connection failed".to_string());
                        self.fail(reason, true).await;
                    }
                    IceConnectionState::Disconnected => {
                        warn!("ICE connectivity degraded");
                        self.observer.emit(CallEvent::CallDoctor);
                    }
                    state if state.is_usable() => self.maybe_connected(),
                    _ => {}
                }
            }
            TransportEvent::LocalCandidate(candidate) => {
                self.send_signaling(SignalingMessage::candidate(&candidate));
            }
            TransportEvent::LocalCandidatesRemoved(candidates) => {
                self.send_signaling(SignalingMessage::removed_candidates(&candidates));
            }
            TransportEvent::RemoteVideoTrack(track) => {
                if let Some(session) = self.session.as_mut() {
                    session.remote_video = Some(track.downgrade());
                }
                info!("Remote video track {} available", track.id());
                self.observer.emit(CallEvent::RemoteVideoTrack(track));
            }
        }
    }

    fn set_stats_enabled(&mut self, enabled: bool) {
        self.stats_override = Some(enabled);
        if !self.session.as_ref().is_some_and(|s| s.published) {
            return;
        }
        if enabled {
            self.start_stats();
        } else {
            self.stop_stats();
        }
    }

    fn start_stats(&mut self) {
        let Some(transport) = self.media.transport() else {
            return;
        };
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.stats_task.is_some() {
            return;
        }

        let tx = self.internal_tx.clone();
        let generation = self.generation;
        let period = self.config.stats_interval();
        session.stats_task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                interval.tick().await;
                let result = transport.stats().await;
                if tx.send(Internal::StatsReady { generation, result }).is_err() {
                    break;
                }
            }
        }));
        debug!("Stats reporting started");
    }

    fn stop_stats(&mut self) {
        if let Some(task) = self.session.as_mut().and_then(|s| s.stats_task.take()) {
            task.abort();
            debug!("Stats reporting stopped");
        }
    }

    fn on_stats(&mut self, generation: u64, result: Result<Vec<StatsReport>, EngineError>) {
        let running = generation == self.generation
            && self.session.as_ref().is_some_and(|s| s.stats_task.is_some());
        if !running {
            debug!("Discarding stats from a stopped timer");
            return;
        }
        match result {
            Ok(reports) => self.observer.emit(CallEvent::Stats(reports)),
            Err(e) => debug!("Stats request failed: {}", e),
        }
    }

    fn send_bye(&mut self) {
        match self.session.as_ref().and_then(|s| s.channel.as_ref()) {
            Some(channel) => {
                info!("Sending bye");
                channel.send(SignalingMessage::Bye);
            }
            None => debug!("No relay channel, bye not sent"),
        }
    }

    async fn switch_camera(&mut self) {
        match self.media.switch_camera().await {
            Ok(Some(capturer)) => {
                info!("Local capture moved to {}", capturer.device_id);
                self.observer.emit(CallEvent::LocalCapturer(capturer));
            }
            Ok(None) => debug!("No local capturer to switch"),
            Err(e) => {
                warn!("Camera switch failed: {}", e);
                self.observer.emit(CallEvent::Error(CallError::media(e)));
            }
        }
    }

    async fn call_up(&mut self) {
        if !self.session.as_ref().is_some_and(|s| s.published) {
            debug!("Call-up ignored until local media is published");
            return;
        }
        self.send_offer().await;
    }

    /// Releases the session, then reports `error` ahead of Disconnected.
    async fn fail(&mut self, error: CallError, send_bye: bool) {
        self.end_session(send_bye, Some(error)).await;
    }

    async fn teardown(&mut self, send_bye: bool) {
        self.end_session(send_bye, None).await;
    }

    /// Ends any call and drops local media that outlived one.
    async fn release(&mut self) {
        self.teardown(true).await;
        self.media.teardown().await;
    }

    /// Releases everything the session holds and reports Disconnected once.
    async fn end_session(&mut self, send_bye: bool, error: Option<CallError>) {
        let Some(mut session) = self.session.take() else {
            if let Some(error) = error {
                self.observer.emit(CallEvent::Error(error));
            }
            debug!("No active session to disconnect");
            return;
        };

        if let Some(task) = session.stats_task.take() {
            task.abort();
        }
        if let Some(mut channel) = session.channel.take() {
            if send_bye {
                channel.send(SignalingMessage::Bye);
            }
            channel.close();
        }
        if let Some(track) = session.remote_video.take().and_then(|t| t.upgrade()) {
            debug!("Releasing remote video track {}", track.id());
        }
        if let Some(forwarder) = session.forwarder.take() {
            forwarder.abort();
        }
        self.media.teardown().await;

        if let Some(client_id) = session.joined.take() {
            self.spawn_leave(session.server_host.clone(), session.room_id.clone(), client_id);
        }

        if let Err(e) = self.state.transition(ConnectionState::Disconnected) {
            warn!("{}", e);
        }
        self.generation += 1;
        info!("Disconnected from room {}", session.room_id);
        if let Some(error) = error {
            self.observer.emit(CallEvent::Error(error));
        }
        self.observer
            .emit(CallEvent::StateChanged(ConnectionState::Disconnected));
    }

    fn spawn_leave(&self, server_host: Url, room_id: RoomId, client_id: ClientId) {
        let negotiator = self.negotiator.clone();
        tokio::spawn(async move {
            if let Err(e) = negotiator.leave(&server_host, &room_id, &client_id).await {
                debug!("Leave for room {} failed: {}", room_id, e);
            }
        });
    }
}
