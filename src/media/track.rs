use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => f.write_str("audio"),
            TrackKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
}

/// Shared handle to a media track. Clones refer to the same track; toggling
/// enablement never recreates it.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: id.into(),
                kind,
                enabled: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    pub fn downgrade(&self) -> WeakTrack {
        WeakTrack(Arc::downgrade(&self.inner))
    }

    pub fn same_track(&self, other: &MediaTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Non-owning reference, for tracks owned by the transport.
#[derive(Debug, Clone)]
pub struct WeakTrack(Weak<TrackInner>);

impl WeakTrack {
    pub fn upgrade(&self) -> Option<MediaTrack> {
        self.0.upgrade().map(|inner| MediaTrack { inner })
    }
}

/// Camera capturer created alongside a local video track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturerHandle {
    pub device_id: String,
}
