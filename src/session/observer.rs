use std::sync::{Arc, Weak};

use tracing::debug;

use super::state::ConnectionState;
use crate::error::CallError;
use crate::media::{CapturerHandle, IceConnectionState, MediaTrack, StatsReport};

/// Receiver of call events. All callbacks come from the coordinator task, one
/// at a time and in order; implementations should return quickly.
pub trait CallObserver: Send + Sync {
    /// Re-registration with the relay gave up; the caller decides whether to redial.
    fn on_reconnect_needed(&self) {}

    /// Degraded but not fatal: connectivity or signaling is struggling.
    fn on_call_doctor(&self) {}

    /// The remote peer left the room.
    fn on_need_leave(&self) {}

    fn on_state_changed(&self, _state: ConnectionState) {}

    fn on_ice_connection_changed(&self, _state: IceConnectionState) {}

    fn on_local_video_track(&self, _track: MediaTrack) {}

    fn on_remote_video_track(&self, _track: MediaTrack) {}

    fn on_error(&self, _error: CallError) {}

    fn on_stats(&self, _reports: Vec<StatsReport>) {}

    fn on_local_capturer(&self, _capturer: CapturerHandle) {}
}

#[derive(Debug, Clone)]
pub enum CallEvent {
    ReconnectNeeded,
    CallDoctor,
    NeedLeave,
    StateChanged(ConnectionState),
    IceConnectionChanged(IceConnectionState),
    LocalVideoTrack(MediaTrack),
    RemoteVideoTrack(MediaTrack),
    Error(CallError),
    Stats(Vec<StatsReport>),
    LocalCapturer(CapturerHandle),
}

impl CallEvent {
    pub fn name(&self) -> &'static str {
        match self {
            CallEvent::ReconnectNeeded => "reconnect-needed",
            CallEvent::CallDoctor => "call-doctor",
            CallEvent::NeedLeave => "need-leave",
            CallEvent::StateChanged(_) => "state-changed",
            CallEvent::IceConnectionChanged(_) => "ice-connection-changed",
            CallEvent::LocalVideoTrack(_) => "local-video-track",
            CallEvent::RemoteVideoTrack(_) => "remote-video-track",
            CallEvent::Error(_) => "error",
            CallEvent::Stats(_) => "stats",
            CallEvent::LocalCapturer(_) => "local-capturer",
        }
    }

    pub fn dispatch(self, observer: &dyn CallObserver) {
        match self {
            CallEvent::ReconnectNeeded => observer.on_reconnect_needed(),
            CallEvent::CallDoctor => observer.on_call_doctor(),
            CallEvent::NeedLeave => observer.on_need_leave(),
            CallEvent::StateChanged(state) => observer.on_state_changed(state),
            CallEvent::IceConnectionChanged(state) => observer.on_ice_connection_changed(state),
            CallEvent::LocalVideoTrack(track) => observer.on_local_video_track(track),
            CallEvent::RemoteVideoTrack(track) => observer.on_remote_video_track(track),
            CallEvent::Error(error) => observer.on_error(error),
            CallEvent::Stats(reports) => observer.on_stats(reports),
            CallEvent::LocalCapturer(capturer) => observer.on_local_capturer(capturer),
        }
    }
}

/// Non-owning observer registration. Once the observer is dropped every
/// event goes nowhere.
pub(crate) struct ObserverSink {
    observer: Weak<dyn CallObserver>,
}

impl ObserverSink {
    pub fn new(observer: Weak<dyn CallObserver>) -> Self {
        Self { observer }
    }

    pub fn emit(&self, event: CallEvent) {
        match self.observer.upgrade() {
            Some(observer) => event.dispatch(observer.as_ref()),
            None => debug!("Observer gone, dropping {} event", event.name()),
        }
    }
}

/// Observer that turns callbacks into an ordered stream of `CallEvent`s.
pub struct EventStream {
    tx: async_channel::Sender<CallEvent>,
}

impl EventStream {
    pub fn new() -> (Arc<Self>, async_channel::Receiver<CallEvent>) {
        let (tx, rx) = async_channel::unbounded();
        (Arc::new(Self { tx }), rx)
    }

    fn push(&self, event: CallEvent) {
        if self.tx.try_send(event).is_err() {
            debug!("Event stream receiver dropped");
        }
    }
}

impl CallObserver for EventStream {
    fn on_reconnect_needed(&self) {
        self.push(CallEvent::ReconnectNeeded);
    }

    fn on_call_doctor(&self) {
        self.push(CallEvent::CallDoctor);
    }

    fn on_need_leave(&self) {
        self.push(CallEvent::NeedLeave);
    }

    fn on_state_changed(&self, state: ConnectionState) {
        self.push(CallEvent::StateChanged(state));
    }

    fn on_ice_connection_changed(&self, state: IceConnectionState) {
        self.push(CallEvent::IceConnectionChanged(state));
    }

    fn on_local_video_track(&self, track: MediaTrack) {
        self.push(CallEvent::LocalVideoTrack(track));
    }

    fn on_remote_video_track(&self, track: MediaTrack) {
        self.push(CallEvent::RemoteVideoTrack(track));
    }

    fn on_error(&self, error: CallError) {
        self.push(CallEvent::Error(error));
    }

    fn on_stats(&self, reports: Vec<StatsReport>) {
        self.push(CallEvent::Stats(reports));
    }

    fn on_local_capturer(&self, capturer: CapturerHandle) {
        self.push(CallEvent::LocalCapturer(capturer));
    }
}
