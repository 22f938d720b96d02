//! Local media capture
//!
//! The [`MediaCaptureGate`] acquires and releases the local microphone and
//! camera for a call. Device access sits behind the [`CaptureDevice`] trait so
//! a platform backend (or a test double) can be plugged in.
//!
//! A [`LocalMedia`] handle is exclusively owned by one call session. Releasing
//! it stops every track; the gate keeps a count of live captures, which is what
//! a "camera in use" indicator would show.

use crate::types::{CallKind, MediaType};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast;

/// Media-related errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The user or platform refused access to the device
    #[error("Device access denied: {0}")]
    DeviceDenied(String),

    /// No usable device
    #[error("Device unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Media events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MediaEvent {
    /// Capture started
    StreamStarted {
        /// Stream identifier
        stream_id: String,
        /// Captured call kind
        kind: CallKind,
    },
    /// Capture stopped
    StreamStopped {
        /// Stream identifier
        stream_id: String,
    },
}

/// One captured track
///
/// Clones share the same enabled/live flags, so a connection backend holding a
/// clone observes mute and stop.
#[derive(Debug, Clone)]
pub struct LocalTrack {
    id: String,
    media_type: MediaType,
    enabled: Arc<AtomicBool>,
    live: Arc<AtomicBool>,
}

impl LocalTrack {
    /// Create a live, enabled track
    pub fn new(id: impl Into<String>, media_type: MediaType) -> Self {
        Self {
            id: id.into(),
            media_type,
            enabled: Arc::new(AtomicBool::new(true)),
            live: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Track identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Track kind
    pub fn media_type(&self) -> MediaType {
        self.media_type
    }

    /// Whether the track currently produces media
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the underlying device is still held
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

/// Exclusively owned capture handle for one session
///
/// Dropping the handle stops its tracks, so a handle can never outlive the
/// device indicator it turned on.
#[derive(Debug)]
pub struct LocalMedia {
    id: String,
    kind: CallKind,
    tracks: Vec<LocalTrack>,
    active: Arc<AtomicUsize>,
    released: bool,
}

impl LocalMedia {
    /// Stream identifier
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Kind this handle was acquired for
    pub fn kind(&self) -> CallKind {
        self.kind
    }

    /// All tracks, audio first
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// Tracks of one media type
    pub fn tracks_of(&self, media_type: MediaType) -> impl Iterator<Item = &LocalTrack> {
        self.tracks
            .iter()
            .filter(move |t| t.media_type() == media_type)
    }

    /// Whether every track still holds its device
    pub fn is_live(&self) -> bool {
        !self.released && self.tracks.iter().all(LocalTrack::is_live)
    }

    fn stop_all(&mut self) {
        if self.released {
            return;
        }
        for track in &self.tracks {
            track.stop();
        }
        self.released = true;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(stream_id = %self.id, "Local media dropped without release");
            self.stop_all();
        }
    }
}

/// Capture device backend
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Open one track of the given kind
    ///
    /// # Errors
    ///
    /// Returns `DeviceDenied` or `DeviceUnavailable` when the device cannot be opened
    async fn open(&self, media_type: MediaType) -> Result<LocalTrack, MediaError>;
}

/// Device backend that always succeeds with synthetic tracks
///
/// Used by the CLI demo and as the default when no platform backend is wired.
#[derive(Debug, Default)]
pub struct SyntheticCaptureDevice {
    opened: AtomicU64,
}

impl SyntheticCaptureDevice {
    /// Create a synthetic device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CaptureDevice for SyntheticCaptureDevice {
    async fn open(&self, media_type: MediaType) -> Result<LocalTrack, MediaError> {
        let n = self.opened.fetch_add(1, Ordering::SeqCst);
        let id = match media_type {
            MediaType::Audio => format!("audio-{n}"),
            MediaType::Video => format!("video-{n}"),
        };
        Ok(LocalTrack::new(id, media_type))
    }
}

/// Acquires and releases capture devices for call sessions
pub struct MediaCaptureGate {
    device: Arc<dyn CaptureDevice>,
    active: Arc<AtomicUsize>,
    next_stream: AtomicU64,
    event_sender: broadcast::Sender<MediaEvent>,
}

impl MediaCaptureGate {
    /// Create a gate over a device backend
    #[must_use]
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        let (event_sender, _) = broadcast::channel(100);
        Self {
            device,
            active: Arc::new(AtomicUsize::new(0)),
            next_stream: AtomicU64::new(0),
            event_sender,
        }
    }

    /// Gate over a [`SyntheticCaptureDevice`]
    #[must_use]
    pub fn synthetic() -> Self {
        Self::new(Arc::new(SyntheticCaptureDevice::new()))
    }

    /// Acquire capture for a call kind
    ///
    /// Audio is always requested, video only for video calls. If a later track
    /// fails, tracks already opened are stopped before the error is returned.
    ///
    /// # Errors
    ///
    /// Returns the device error of the first track that could not be opened
    #[tracing::instrument(skip(self))]
    pub async fn acquire(&self, kind: CallKind) -> Result<LocalMedia, MediaError> {
        let mut tracks = Vec::new();
        for media_type in kind.media_types() {
            match self.device.open(media_type).await {
                Ok(track) => tracks.push(track),
                Err(e) => {
                    tracing::warn!(?media_type, error = %e, "Capture device refused");
                    for track in &tracks {
                        track.stop();
                    }
                    return Err(e);
                }
            }
        }

        let stream_id = format!("local-{}", self.next_stream.fetch_add(1, Ordering::SeqCst));
        self.active.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(stream_id = %stream_id, tracks = tracks.len(), "Local media acquired");

        let _ = self.event_sender.send(MediaEvent::StreamStarted {
            stream_id: stream_id.clone(),
            kind,
        });

        Ok(LocalMedia {
            id: stream_id,
            kind,
            tracks,
            active: self.active.clone(),
            released: false,
        })
    }

    /// Release a capture handle, stopping every track
    pub fn release(&self, mut media: LocalMedia) {
        media.stop_all();
        tracing::debug!(stream_id = %media.id, "Local media released");
        let _ = self.event_sender.send(MediaEvent::StreamStopped {
            stream_id: media.id.clone(),
        });
    }

    /// Enable or disable the audio tracks
    pub fn set_muted(&self, media: &LocalMedia, muted: bool) {
        for track in media.tracks_of(MediaType::Audio) {
            track.set_enabled(!muted);
        }
    }

    /// Enable or disable the video tracks; no-op for audio calls
    pub fn set_camera_enabled(&self, media: &LocalMedia, enabled: bool) {
        for track in media.tracks_of(MediaType::Video) {
            track.set_enabled(enabled);
        }
    }

    /// Number of captures currently holding a device
    #[must_use]
    pub fn active_captures(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Subscribe to media events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MediaEvent> {
        self.event_sender.subscribe()
    }
}

impl Default for MediaCaptureGate {
    fn default() -> Self {
        Self::synthetic()
    }
}
