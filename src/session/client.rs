use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, oneshot};

use super::coordinator::{Command, Coordinator};
use super::observer::CallObserver;
use super::settings::ConnectRequest;
use super::state::ConnectionState;
use crate::config::ClientConfig;
use crate::error::CallError;
use crate::media::{MediaConstraints, MediaEngine, TrackKind};
use crate::negotiation::RoomNegotiator;

/// Handle to a call coordinator running on its own task.
///
/// Every method returns as soon as the command is queued; progress is reported
/// to the observer. Once the coordinator has been released all calls fail with
/// `CallError::ClientClosed`.
#[derive(Clone)]
pub struct CallClient {
    tx: mpsc::Sender<Command>,
}

impl CallClient {
    /// Spawns the coordinator. Only a weak reference to `observer` is kept, so
    /// dropping it silences the client without stopping it.
    pub fn spawn<O>(
        config: ClientConfig,
        engine: Arc<dyn MediaEngine>,
        negotiator: Arc<dyn RoomNegotiator>,
        observer: &Arc<O>,
    ) -> Self
    where
        O: CallObserver + 'static,
    {
        let weak = Arc::downgrade(observer);
        let weak: Weak<dyn CallObserver> = weak;
        let (tx, rx) = mpsc::channel(config.command_queue_depth.max(1));
        let (coordinator, inbox) = Coordinator::new(config, engine, negotiator, weak);
        tokio::spawn(coordinator.run(rx, inbox));
        Self { tx }
    }

    /// Starts a call. Fails immediately if a call is already in progress or the
    /// request is unusable; everything later is reported to the observer.
    pub async fn connect(&self, request: ConnectRequest) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Connect {
            request: Box::new(request),
            reply: reply_tx,
        })
        .await?;
        reply_rx.await.map_err(|_| CallError::ClientClosed)?
    }

    /// Repeats the last accepted connect. Does nothing unless Disconnected.
    pub async fn reconnect(&self) -> Result<(), CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::Reconnect { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| CallError::ClientClosed)?
    }

    pub async fn disconnect(&self, without_bye: bool) -> Result<(), CallError> {
        self.send(Command::Disconnect { without_bye }).await
    }

    /// Disconnects and stops the coordinator task.
    pub async fn disconnect_and_release(&self) -> Result<(), CallError> {
        self.send(Command::Release).await
    }

    pub async fn send_bye(&self) -> Result<(), CallError> {
        self.send(Command::SendBye).await
    }

    /// Sends a fresh offer on the current call.
    pub async fn call_up(&self) -> Result<(), CallError> {
        self.send(Command::CallUp).await
    }

    pub async fn mute_audio(&self) -> Result<(), CallError> {
        self.set_muted(TrackKind::Audio, true).await
    }

    pub async fn unmute_audio(&self) -> Result<(), CallError> {
        self.set_muted(TrackKind::Audio, false).await
    }

    pub async fn mute_video(&self) -> Result<(), CallError> {
        self.set_muted(TrackKind::Video, true).await
    }

    pub async fn unmute_video(&self) -> Result<(), CallError> {
        self.set_muted(TrackKind::Video, false).await
    }

    async fn set_muted(&self, kind: TrackKind, muted: bool) -> Result<(), CallError> {
        self.send(Command::SetMuted { kind, muted }).await
    }

    pub async fn create_local_video(&self) -> Result<(), CallError> {
        self.send(Command::CreateLocalVideo).await
    }

    /// Moves local capture to the other camera.
    pub async fn switch_camera(&self) -> Result<(), CallError> {
        self.send(Command::SwitchCamera).await
    }

    pub async fn set_audio_only(&self, audio_only: bool) -> Result<(), CallError> {
        self.send(Command::SetAudioOnly(audio_only)).await
    }

    pub async fn register_with_relay_if_ready(&self) -> Result<(), CallError> {
        self.send(Command::RegisterWithRelay).await
    }

    pub async fn set_active_audio_session(&self) -> Result<(), CallError> {
        self.send(Command::SetAudioSessionActive(true)).await
    }

    pub async fn deactivate_audio_session(&self) -> Result<(), CallError> {
        self.send(Command::SetAudioSessionActive(false)).await
    }

    /// Video sender cap in kbps, kept for later calls too.
    pub async fn set_max_bitrate(&self, kbps: u32) -> Result<(), CallError> {
        self.send(Command::SetMaxBitrate(kbps)).await
    }

    pub async fn set_camera_constraints(&self, constraints: MediaConstraints) -> Result<(), CallError> {
        self.send(Command::SetCameraConstraints(constraints)).await
    }

    /// Creates and adds any missing local tracks to the current call.
    pub async fn set_up_media_sender(&self) -> Result<(), CallError> {
        self.send(Command::SetUpMediaSender).await
    }

    pub async fn set_stats_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.send(Command::SetStatsEnabled(enabled)).await
    }

    pub async fn state(&self) -> Result<ConnectionState, CallError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(Command::State { reply: reply_tx }).await?;
        reply_rx.await.map_err(|_| CallError::ClientClosed)
    }

    async fn send(&self, command: Command) -> Result<(), CallError> {
        self.tx.send(command).await.map_err(|_| CallError::ClientClosed)
    }
}
