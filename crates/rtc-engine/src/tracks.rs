//! Local capture track management.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use rtc_ipc::{AudioCaptureConfig, MediaKind, RenderOptions, VideoCaptureConfig};
use rtc_transport::{TrackHandle, TransportError, TransportProvider};

use crate::error::SessionError;
use crate::SessionResult;

/// One local capture stream.
#[derive(Debug)]
pub struct LocalTrack {
    handle: TrackHandle,
    published: AtomicBool,
}

impl LocalTrack {
    fn new(handle: TrackHandle) -> Arc<Self> {
        Arc::new(Self {
            handle,
            published: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        self.handle.id()
    }

    pub fn kind(&self) -> MediaKind {
        self.handle.kind()
    }

    /// The provider's track.
    pub fn handle(&self) -> &TrackHandle {
        &self.handle
    }

    pub fn is_playing(&self) -> bool {
        self.handle.is_playing()
    }

    /// A live track has not been closed.
    pub fn is_live(&self) -> bool {
        !self.handle.is_closed()
    }

    /// Whether the track was published to the current channel.
    pub fn is_published(&self) -> bool {
        self.published.load(Ordering::SeqCst)
    }

    pub(crate) fn set_published(&self, published: bool) {
        self.published.store(published, Ordering::SeqCst);
    }
}

/// The microphone and camera pair.
#[derive(Debug, Clone)]
pub struct LocalTracks {
    pub audio: Arc<LocalTrack>,
    pub video: Arc<LocalTrack>,
}

impl LocalTracks {
    pub fn is_live(&self) -> bool {
        self.audio.is_live() && self.video.is_live()
    }

    pub fn is_published(&self) -> bool {
        self.audio.is_published() && self.video.is_published()
    }

    /// Provider handles in publish order (video first).
    pub fn handles(&self) -> Vec<TrackHandle> {
        vec![
            Arc::clone(self.video.handle()),
            Arc::clone(self.audio.handle()),
        ]
    }

    pub(crate) fn set_published(&self, published: bool) {
        self.audio.set_published(published);
        self.video.set_published(published);
    }
}

/// Creates, plays and closes local capture tracks.
pub struct MediaTrackManager {
    provider: Arc<dyn TransportProvider>,
    tracks: Mutex<Option<LocalTracks>>,
    // Held across the provider call so concurrent callers share one acquisition.
    creating: tokio::sync::Mutex<()>,
    // Bumped by `close_all`. Acquisitions started before a bump are discarded.
    generation: AtomicU64,
}

impl MediaTrackManager {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self {
            provider,
            tracks: Mutex::new(None),
            creating: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    /// Acquire microphone and camera.
    ///
    /// Returns the existing pair if it is still live. A caller arriving while
    /// another acquisition is in flight waits for it and shares its result.
    ///
    /// Fails with [`SessionError::Cancelled`] if [`Self::close_all`] runs
    /// while the call is pending; a pair acquired in the meantime is closed.
    pub async fn create_tracks(
        &self,
        audio: &AudioCaptureConfig,
        video: &VideoCaptureConfig,
    ) -> SessionResult<LocalTracks> {
        self.create_tracks_since(self.generation(), audio, video)
            .await
    }

    /// Like [`Self::create_tracks`], but also cancelled by a `close_all`
    /// that ran after `generation` was read.
    #[instrument(name = "create_tracks", skip(self, audio, video))]
    pub async fn create_tracks_since(
        &self,
        generation: u64,
        audio: &AudioCaptureConfig,
        video: &VideoCaptureConfig,
    ) -> SessionResult<LocalTracks> {
        if self.generation() != generation {
            return Err(SessionError::Cancelled);
        }
        if let Some(tracks) = self.live() {
            return Ok(tracks);
        }

        let _creating = self.creating.lock().await;
        if self.generation() != generation {
            debug!("Tracks released while waiting, not acquiring");
            return Err(SessionError::Cancelled);
        }
        if let Some(tracks) = self.live() {
            debug!("Tracks created by a concurrent caller");
            return Ok(tracks);
        }

        let (audio_track, video_track) = self
            .provider
            .create_microphone_and_camera_tracks(audio, video)
            .await
            .map_err(|e| {
                warn!(error = %e, "Local track creation failed");
                SessionError::DeviceAcquisition(e)
            })?;

        let tracks = LocalTracks {
            audio: LocalTrack::new(audio_track),
            video: LocalTrack::new(video_track),
        };

        let stored = {
            let mut current = self.tracks.lock();
            let fresh = self.generation() == generation;
            if fresh {
                *current = Some(tracks.clone());
            }
            fresh
        };
        if !stored {
            debug!("Tracks released during acquisition, closing");
            self.close(tracks.audio.handle());
            self.close(tracks.video.handle());
            return Err(SessionError::Cancelled);
        }

        info!(audio = tracks.audio.id(), video = tracks.video.id(), "Local tracks created");
        Ok(tracks)
    }

    /// Release generation. Advances on every [`Self::close_all`].
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    /// The current pair, if both tracks are live.
    pub fn live(&self) -> Option<LocalTracks> {
        self.tracks.lock().clone().filter(LocalTracks::is_live)
    }

    /// Whether a live pair exists.
    pub fn is_ready(&self) -> bool {
        self.live().is_some()
    }

    /// Render a track. No-op if it is already playing.
    pub async fn play(
        &self,
        track: &TrackHandle,
        surface_id: Option<&str>,
        options: RenderOptions,
    ) -> SessionResult<()> {
        if track.is_closed() {
            return Err(SessionError::TrackClosed(track.id().to_string()));
        }
        if track.is_playing() {
            debug!(track = track.id(), "Already playing");
            return Ok(());
        }

        track
            .play(surface_id, options)
            .await
            .map_err(|e| match e {
                TransportError::SurfaceNotFound(surface) => {
                    SessionError::PlaybackTargetInvalid(surface)
                }
                other => SessionError::Playback(other),
            })?;

        debug!(track = track.id(), surface = ?surface_id, "Playing track");
        Ok(())
    }

    /// Release a track's device. Closing twice is a no-op.
    pub fn close(&self, track: &TrackHandle) {
        if track.is_closed() {
            return;
        }
        track.close();
        debug!(track = track.id(), "Track closed");
    }

    /// Close and forget the current pair, and cancel any acquisition in
    /// flight. Returns true if a pair existed.
    pub fn close_all(&self) -> bool {
        let taken = {
            let mut current = self.tracks.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            current.take()
        };
        let Some(tracks) = taken else {
            return false;
        };

        tracks.set_published(false);
        self.close(tracks.audio.handle());
        self.close(tracks.video.handle());
        info!("Local tracks released");
        true
    }
}

impl Drop for MediaTrackManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
