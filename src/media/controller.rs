use std::sync::Arc;

use tracing::{debug, info, warn};

use super::engine::{EngineError, MediaConstraints, MediaEngine, PeerTransport};
use super::track::{CapturerHandle, MediaTrack, TrackKind};

/// Local tracks produced by one creation request.
#[derive(Debug, Default)]
pub struct LocalTracks {
    pub audio: Option<MediaTrack>,
    pub video: Option<MediaTrack>,
    pub capturer: Option<CapturerHandle>,
}

/// Snapshot of everything needed to create tracks, so creation can run off the
/// control task.
pub struct TrackRequest {
    engine: Arc<dyn MediaEngine>,
    audio: bool,
    video: bool,
    camera: MediaConstraints,
}

impl TrackRequest {
    pub fn is_empty(&self) -> bool {
        !self.audio && !self.video
    }

    pub async fn create(self) -> Result<LocalTracks, EngineError> {
        let mut tracks = LocalTracks::default();

        if self.audio {
            tracks.audio = Some(self.engine.create_audio_track(&MediaConstraints::default()).await?);
        }
        if self.video {
            let (track, capturer) = self.engine.create_video_track(&self.camera).await?;
            tracks.video = Some(track);
            tracks.capturer = Some(capturer);
        }
        Ok(tracks)
    }
}

/// Owns the local tracks and the media-facing side of the transport.
///
/// Mute flags, the audio-only flag and explicit bitrate / constraint overrides
/// outlive a session. They are applied to whatever tracks and transport exist
/// now, or to the next ones created.
pub struct MediaController {
    engine: Arc<dyn MediaEngine>,
    audio_only: bool,
    audio_muted: bool,
    video_muted: bool,
    bitrate_override_kbps: Option<u32>,
    constraints_override: Option<MediaConstraints>,
    session_bitrate_kbps: Option<u32>,
    session_constraints: MediaConstraints,
    tracks: LocalTracks,
    transport: Option<Arc<dyn PeerTransport>>,
}

impl MediaController {
    pub fn new(engine: Arc<dyn MediaEngine>) -> Self {
        Self {
            engine,
            audio_only: false,
            audio_muted: false,
            video_muted: false,
            bitrate_override_kbps: None,
            constraints_override: None,
            session_bitrate_kbps: None,
            session_constraints: MediaConstraints::default(),
            tracks: LocalTracks::default(),
            transport: None,
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Per-call values. Explicit `set_*` calls made earlier still take precedence.
    pub fn prepare(&mut self, audio_only: bool, max_bitrate_kbps: u32, camera: MediaConstraints) {
        self.audio_only = audio_only;
        self.session_bitrate_kbps = (max_bitrate_kbps > 0).then_some(max_bitrate_kbps);
        self.session_constraints = camera;
    }

    pub fn bitrate_kbps(&self) -> Option<u32> {
        self.bitrate_override_kbps.or(self.session_bitrate_kbps)
    }

    pub fn camera_constraints(&self) -> &MediaConstraints {
        self.constraints_override
            .as_ref()
            .unwrap_or(&self.session_constraints)
    }

    /// Requests whichever local tracks are still missing.
    pub fn track_request(&self) -> TrackRequest {
        TrackRequest {
            engine: self.engine.clone(),
            audio: self.tracks.audio.is_none(),
            video: !self.audio_only && self.tracks.video.is_none(),
            camera: self.camera_constraints().clone(),
        }
    }

    /// Camera track only; empty when one already exists.
    pub fn video_request(&self) -> TrackRequest {
        TrackRequest {
            engine: self.engine.clone(),
            audio: false,
            video: self.tracks.video.is_none(),
            camera: self.camera_constraints().clone(),
        }
    }

    /// Takes ownership of freshly created tracks and applies pending mute state.
    pub fn install(&mut self, tracks: LocalTracks) {
        if let Some(audio) = tracks.audio {
            audio.set_enabled(!self.audio_muted);
            self.tracks.audio = Some(audio);
        }
        if let Some(video) = tracks.video {
            video.set_enabled(!self.video_muted && !self.audio_only);
            self.tracks.video = Some(video);
        }
        if tracks.capturer.is_some() {
            self.tracks.capturer = tracks.capturer;
        }
    }

    pub fn local_video(&self) -> Option<&MediaTrack> {
        self.tracks.video.as_ref()
    }

    pub fn capturer(&self) -> Option<&CapturerHandle> {
        self.tracks.capturer.as_ref()
    }

    pub fn attach_transport(&mut self, transport: Arc<dyn PeerTransport>) {
        self.transport = Some(transport);
    }

    pub fn transport(&self) -> Option<Arc<dyn PeerTransport>> {
        self.transport.clone()
    }

    /// Adds every local track to the transport and applies the bitrate cap.
    pub async fn publish(&self) -> Result<(), EngineError> {
        let Some(transport) = &self.transport else {
            return Err(EngineError::Closed);
        };

        for track in [&self.tracks.audio, &self.tracks.video].into_iter().flatten() {
            transport.add_track(track).await?;
            debug!("Published local {} track {}", track.kind(), track.id());
        }
        self.apply_bitrate().await;
        Ok(())
    }

    /// Adds a single track created after publishing, e.g. a late local video.
    pub async fn publish_track(&self, kind: TrackKind) -> Result<(), EngineError> {
        let track = match kind {
            TrackKind::Audio => self.tracks.audio.as_ref(),
            TrackKind::Video => self.tracks.video.as_ref(),
        };
        match (&self.transport, track) {
            (Some(transport), Some(track)) => transport.add_track(track).await,
            _ => Ok(()),
        }
    }

    /// Cap in kbps. Zero is ignored.
    pub async fn set_max_bitrate(&mut self, kbps: u32) {
        if kbps == 0 {
            debug!("Ignoring zero bitrate cap");
            return;
        }
        self.bitrate_override_kbps = Some(kbps);
        self.apply_bitrate().await;
    }

    async fn apply_bitrate(&self) {
        let (Some(transport), Some(kbps)) = (&self.transport, self.bitrate_kbps()) else {
            return;
        };
        match transport.set_max_bitrate(kbps.saturating_mul(1000)).await {
            Ok(()) => info!("Video bitrate capped at {} kbps", kbps),
            Err(e) => warn!("Failed to apply bitrate cap: {}", e),
        }
    }

    /// `Ok(None)` when there is no capturer to move.
    pub async fn switch_camera(&mut self) -> Result<Option<CapturerHandle>, EngineError> {
        let Some(current) = &self.tracks.capturer else {
            return Ok(None);
        };
        let next = self.engine.switch_camera(current).await?;
        self.tracks.capturer = Some(next.clone());
        Ok(Some(next))
    }

    /// Takes effect on the next video track creation.
    pub fn set_camera_constraints(&mut self, constraints: MediaConstraints) {
        self.constraints_override = Some(constraints);
    }

    pub fn set_muted(&mut self, kind: TrackKind, muted: bool) {
        match kind {
            TrackKind::Audio => {
                self.audio_muted = muted;
                if let Some(track) = &self.tracks.audio {
                    track.set_enabled(!muted);
                }
            }
            TrackKind::Video => {
                self.video_muted = muted;
                if let Some(track) = &self.tracks.video {
                    track.set_enabled(!muted && !self.audio_only);
                }
            }
        }
        debug!("Local {} {}", kind, if muted { "muted" } else { "unmuted" });
    }

    /// Switching to audio-only silences an existing video track; switching back
    /// restores it unless video is muted.
    pub fn set_audio_only(&mut self, audio_only: bool) {
        self.audio_only = audio_only;
        if let Some(track) = &self.tracks.video {
            track.set_enabled(!audio_only && !self.video_muted);
        }
    }

    pub fn set_audio_session_active(&self, active: bool) {
        self.engine.set_audio_session_active(active);
    }

    /// Drops every local track and closes the transport.
    pub async fn teardown(&mut self) {
        let tracks = std::mem::take(&mut self.tracks);
        for track in [tracks.audio, tracks.video].into_iter().flatten() {
            track.set_enabled(false);
        }
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
    }
}
