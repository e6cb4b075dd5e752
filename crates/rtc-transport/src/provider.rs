//! Traits for the external media engine.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use rtc_ipc::{
    AudioCaptureConfig, ClientMode, Device, JoinParams, LogLevel, MediaKind, RenderOptions,
    VideoCaptureConfig, VideoCodec,
};

use crate::connection::ConnectionChange;
use crate::TransportResult;

/// A single audio or video stream, captured locally or received from a peer.
#[async_trait]
pub trait MediaTrack: Send + Sync + fmt::Debug {
    /// Provider track identifier.
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn is_playing(&self) -> bool;

    /// Whether the underlying device handle has been released.
    fn is_closed(&self) -> bool;

    /// Render the track. Video needs a surface; audio plays to the default
    /// output when `surface_id` is `None`.
    async fn play(&self, surface_id: Option<&str>, options: RenderOptions)
        -> TransportResult<()>;

    /// Stop rendering without releasing the device.
    fn stop(&self);

    /// Release the underlying device. Closing twice is a no-op.
    fn close(&self);
}

/// Shared handle to a track.
pub type TrackHandle = Arc<dyn MediaTrack>;

/// Notifications pushed by a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw connectivity changed.
    ConnectionStateChange(ConnectionChange),

    /// A peer entered the channel.
    UserJoined { participant_id: String },

    /// A peer left the channel.
    UserLeft { participant_id: String },

    /// A peer published a track.
    UserPublished {
        participant_id: String,
        kind: MediaKind,
    },

    /// A peer stopped publishing a track.
    UserUnpublished {
        participant_id: String,
        kind: MediaKind,
    },
}

impl TransportEvent {
    /// Returns a simple string representation of the event kind.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChange(_) => "connection-state-change",
            Self::UserJoined { .. } => "user-joined",
            Self::UserLeft { .. } => "user-left",
            Self::UserPublished { .. } => "user-published",
            Self::UserUnpublished { .. } => "user-unpublished",
        }
    }
}

/// Where a client delivers its notifications.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Receiving end of an [`EventSink`].
pub type EventStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Creates an event channel for [`TransportClient::set_event_sink`].
pub fn event_channel() -> (EventSink, EventStream) {
    mpsc::unbounded_channel()
}

/// A connection to the provider's signaling and media network.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Register where notifications are delivered. Replaces any previous sink.
    fn set_event_sink(&self, sink: EventSink);

    /// Whether the client is currently in a channel.
    fn is_joined(&self) -> bool;

    async fn join(&self, params: &JoinParams) -> TransportResult<()>;

    /// Send local tracks to the channel.
    async fn publish(&self, tracks: &[TrackHandle]) -> TransportResult<()>;

    /// Request a peer's track of the given kind.
    async fn subscribe(&self, participant_id: &str, kind: MediaKind)
        -> TransportResult<TrackHandle>;

    async fn leave(&self) -> TransportResult<()>;
}

/// Shared handle to a client.
pub type ClientHandle = Arc<dyn TransportClient>;

/// Entry points of the media engine.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Set the engine's own log verbosity.
    fn set_log_level(&self, level: LogLevel);

    fn create_client(&self, mode: ClientMode, codec: VideoCodec) -> TransportResult<ClientHandle>;

    /// Acquire microphone and camera in one request.
    async fn create_microphone_and_camera_tracks(
        &self,
        audio: &AudioCaptureConfig,
        video: &VideoCaptureConfig,
    ) -> TransportResult<(TrackHandle, TrackHandle)>;

    async fn enumerate_devices(&self) -> TransportResult<Vec<Device>>;
}
