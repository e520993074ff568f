//! Local media acquisition and the entire-screen policy.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proctor_protocol::StreamType;
use tracing::{debug, info};
use webrtc::track::track_local::TrackLocal;

use crate::error::CaptureError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// What a display capture is showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SurfaceKind {
    Monitor,
    Window,
    Other,
}

/// A single local media track, as produced by a capture backend.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn label(&self) -> &str;
    /// Surface reported by display capture, when the backend knows it.
    fn display_surface(&self) -> Option<SurfaceKind>;
    fn is_live(&self) -> bool;
    fn stop(&self);
    /// RTP source that a peer connection can send.
    fn rtp_track(&self) -> Option<Arc<dyn TrackLocal + Send + Sync>> {
        None
    }
}

pub type TrackList = Vec<Arc<dyn MediaTrack>>;

/// Platform capture entry points: camera plus microphone, and display capture.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn user_media(&self) -> Result<TrackList, CaptureError>;
    async fn display_media(&self) -> Result<TrackList, CaptureError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOwnership {
    /// Captured here; released (tracks stopped) here.
    Owned,
    /// Supplied by the caller; its tracks are never stopped here.
    Borrowed,
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
pub struct CapturedStream {
    id: u64,
    stream_type: StreamType,
    tracks: TrackList,
    surface: SurfaceKind,
    ownership: StreamOwnership,
    reused: bool,
}

impl CapturedStream {
    fn new(stream_type: StreamType, tracks: TrackList, ownership: StreamOwnership) -> Self {
        let surface = classify_surface(&tracks);
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            stream_type,
            tracks,
            surface,
            ownership,
            reused: false,
        }
    }

    /// Wraps a stream the caller already holds, e.g. one authorized before the exam began.
    pub fn borrowed(stream_type: StreamType, tracks: TrackList) -> Self {
        Self::new(stream_type, tracks, StreamOwnership::Borrowed)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn stream_type(&self) -> StreamType {
        self.stream_type
    }

    pub fn tracks(&self) -> &[Arc<dyn MediaTrack>] {
        &self.tracks
    }

    pub fn surface_kind(&self) -> SurfaceKind {
        self.surface
    }

    pub fn ownership(&self) -> StreamOwnership {
        self.ownership
    }

    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn is_live(&self) -> bool {
        !self.tracks.is_empty() && self.tracks.iter().all(|track| track.is_live())
    }

    fn reused(mut self) -> Self {
        self.reused = true;
        self
    }

    fn stop_tracks(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Surface of the first video track, falling back to its label when the
/// backend does not report one.
pub fn classify_surface(tracks: &[Arc<dyn MediaTrack>]) -> SurfaceKind {
    let Some(video) = tracks.iter().find(|track| track.kind() == TrackKind::Video) else {
        return SurfaceKind::Other;
    };
    if let Some(surface) = video.display_surface() {
        return surface;
    }
    let label = video.label().to_ascii_lowercase();
    if label.contains("entire screen") || label.starts_with("screen") {
        SurfaceKind::Monitor
    } else if label.contains("window") {
        SurfaceKind::Window
    } else {
        SurfaceKind::Other
    }
}

pub fn validate(stream_type: StreamType, stream: &CapturedStream) -> Result<(), CaptureError> {
    if !stream.tracks.iter().any(|track| track.kind() == TrackKind::Video) {
        return Err(CaptureError::NoVideoTrack);
    }
    if stream_type == StreamType::Screen && stream.surface != SurfaceKind::Monitor {
        return Err(CaptureError::NotEntireScreen);
    }
    Ok(())
}

struct CachedCapture {
    stream: CapturedStream,
    leased: bool,
}

/// Hands out captures to peer links, reusing live ones instead of prompting again.
///
/// A capture is leased to at most one link at a time. Releasing stops the
/// tracks of owned captures; parking returns them untouched for the next
/// equivalent request.
pub struct CaptureManager {
    devices: Arc<dyn MediaDevices>,
    cache: Mutex<Vec<CachedCapture>>,
    prompt: tokio::sync::Mutex<()>,
}

impl CaptureManager {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            cache: Mutex::new(Vec::new()),
            prompt: tokio::sync::Mutex::new(()),
        }
    }

    pub async fn acquire(
        &self,
        stream_type: StreamType,
        pre_authorized: Option<&CapturedStream>,
    ) -> Result<CapturedStream, CaptureError> {
        if let Some(supplied) = pre_authorized {
            if supplied.stream_type == stream_type && supplied.is_live() {
                validate(stream_type, supplied)?;
                debug!(stream_type = %stream_type, "reusing pre-authorized stream");
                let mut borrowed = supplied.clone();
                borrowed.ownership = StreamOwnership::Borrowed;
                return Ok(borrowed.reused());
            }
        }

        // One permission prompt at a time; a second request waits and can
        // then reuse what the first one captured.
        let _prompt = self.prompt.lock().await;

        if let Some(stream) = self.lease_cached(stream_type) {
            debug!(stream_type = %stream_type, stream_id = stream.id, "reusing live capture");
            return Ok(stream.reused());
        }

        let tracks = match stream_type {
            StreamType::Webcam => self.devices.user_media().await?,
            StreamType::Screen => self.devices.display_media().await?,
        };
        let stream = CapturedStream::new(stream_type, tracks, StreamOwnership::Owned);
        if let Err(err) = validate(stream_type, &stream) {
            info!(
                stream_type = %stream_type,
                surface = ?stream.surface,
                error = %err,
                "capture rejected"
            );
            stream.stop_tracks();
            return Err(err);
        }

        self.cache.lock().push(CachedCapture {
            stream: stream.clone(),
            leased: true,
        });
        Ok(stream)
    }

    /// Ends a lease and stops the tracks of an owned capture.
    pub fn release(&self, stream: &CapturedStream) {
        if stream.ownership == StreamOwnership::Borrowed {
            return;
        }
        let removed = {
            let mut cache = self.cache.lock();
            let position = cache.iter().position(|cached| cached.stream.id == stream.id);
            position.map(|index| cache.remove(index))
        };
        if removed.is_some() {
            stream.stop_tracks();
        }
    }

    /// Ends a lease but keeps the capture running for reuse.
    pub fn park(&self, stream: &CapturedStream) {
        if stream.ownership == StreamOwnership::Borrowed {
            return;
        }
        let mut cache = self.cache.lock();
        if let Some(cached) = cache.iter_mut().find(|cached| cached.stream.id == stream.id) {
            cached.leased = false;
        }
    }

    /// Stops every owned capture, leased or not.
    pub fn release_all(&self) {
        let drained: Vec<CachedCapture> = self.cache.lock().drain(..).collect();
        for cached in drained {
            cached.stream.stop_tracks();
        }
    }

    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn lease_cached(&self, stream_type: StreamType) -> Option<CapturedStream> {
        let mut cache = self.cache.lock();
        cache.retain(|cached| cached.stream.is_live());
        let cached = cache
            .iter_mut()
            .find(|cached| cached.stream.stream_type == stream_type && !cached.leased)?;
        cached.leased = true;
        Some(cached.stream.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDevices, MockTrack};

    fn manager(devices: &Arc<MockDevices>) -> CaptureManager {
        CaptureManager::new(devices.clone())
    }

    #[tokio::test]
    async fn window_share_is_rejected_and_stopped() {
        let devices = Arc::new(MockDevices::new());
        devices.set_display_surface(Some(SurfaceKind::Window));
        let captures = manager(&devices);

        let err = captures.acquire(StreamType::Screen, None).await.unwrap_err();

        assert_eq!(err, CaptureError::NotEntireScreen);
        assert_eq!(err.reason(), "not entire screen");
        assert!(devices.created().iter().all(|track| track.stop_count() == 1));
        assert_eq!(captures.cached(), 0);
    }

    #[tokio::test]
    async fn entire_screen_label_is_accepted_without_surface_hint() {
        let devices = Arc::new(MockDevices::new());
        devices.set_display_surface(None);
        devices.set_display_label("Entire screen");
        let captures = manager(&devices);

        let stream = captures.acquire(StreamType::Screen, None).await.unwrap();

        assert_eq!(stream.surface_kind(), SurfaceKind::Monitor);
        assert!(!stream.is_reused());
    }

    #[tokio::test]
    async fn live_pre_authorized_stream_is_borrowed() {
        let devices = Arc::new(MockDevices::new());
        let captures = manager(&devices);
        let track = Arc::new(MockTrack::video("cam-0", "FaceTime HD Camera", None));
        let supplied = CapturedStream::borrowed(StreamType::Webcam, vec![track.clone() as Arc<dyn MediaTrack>]);

        let stream = captures
            .acquire(StreamType::Webcam, Some(&supplied))
            .await
            .unwrap();

        assert!(stream.is_reused());
        assert_eq!(stream.ownership(), StreamOwnership::Borrowed);
        assert_eq!(devices.user_media_calls(), 0);

        captures.release(&stream);
        assert_eq!(track.stop_count(), 0);
    }

    #[tokio::test]
    async fn ended_pre_authorized_stream_triggers_fresh_capture() {
        let devices = Arc::new(MockDevices::new());
        let captures = manager(&devices);
        let track = Arc::new(MockTrack::video("cam-0", "camera", None));
        track.stop();
        let supplied = CapturedStream::borrowed(StreamType::Webcam, vec![track as Arc<dyn MediaTrack>]);

        let stream = captures
            .acquire(StreamType::Webcam, Some(&supplied))
            .await
            .unwrap();

        assert!(!stream.is_reused());
        assert_eq!(stream.ownership(), StreamOwnership::Owned);
        assert_eq!(devices.user_media_calls(), 1);
    }

    #[tokio::test]
    async fn parked_capture_is_reused_without_prompting() {
        let devices = Arc::new(MockDevices::new());
        let captures = manager(&devices);

        let first = captures.acquire(StreamType::Webcam, None).await.unwrap();
        captures.park(&first);
        let second = captures.acquire(StreamType::Webcam, None).await.unwrap();

        assert_eq!(second.id(), first.id());
        assert!(second.is_reused());
        assert_eq!(devices.user_media_calls(), 1);
    }

    #[tokio::test]
    async fn leased_capture_is_not_shared() {
        let devices = Arc::new(MockDevices::new());
        let captures = manager(&devices);

        let first = captures.acquire(StreamType::Webcam, None).await.unwrap();
        let second = captures.acquire(StreamType::Webcam, None).await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(devices.user_media_calls(), 2);
    }

    #[tokio::test]
    async fn release_stops_owned_tracks_once() {
        let devices = Arc::new(MockDevices::new());
        let captures = manager(&devices);
        let stream = captures.acquire(StreamType::Webcam, None).await.unwrap();

        captures.release(&stream);
        captures.release(&stream);

        assert!(devices.created().iter().all(|track| track.stop_count() == 1));
        assert_eq!(captures.cached(), 0);
    }

    #[tokio::test]
    async fn denied_permission_surfaces_as_capture_error() {
        let devices = Arc::new(MockDevices::new());
        devices.deny("user dismissed the prompt");
        let captures = manager(&devices);

        let err = captures.acquire(StreamType::Webcam, None).await.unwrap_err();

        assert!(matches!(err, CaptureError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn missing_display_surfaces_as_device_unavailable() {
        let devices = Arc::new(MockDevices::new());
        devices.unplug("no display attached");
        let captures = manager(&devices);

        let err = captures.acquire(StreamType::Screen, None).await.unwrap_err();

        assert_eq!(err, CaptureError::DeviceUnavailable("no display attached".to_string()));
        assert_eq!(err.reason(), "capture device unavailable: no display attached");
        assert_eq!(captures.cached(), 0);
    }
}
