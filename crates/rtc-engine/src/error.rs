//! Error types for the session engine.

use rtc_ipc::{JoinState, MediaKind};
use rtc_transport::TransportError;
use thiserror::Error;

/// Errors that can occur during session operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// Devices could not be enumerated.
    #[error("Device enumeration failed: {0}")]
    DeviceEnumeration(#[source] TransportError),

    /// Capture permission denied or no capture device.
    #[error("Device acquisition failed: {0}")]
    DeviceAcquisition(#[source] TransportError),

    /// The transport client could not be created.
    #[error("Client creation failed: {0}")]
    ClientCreation(#[source] TransportError),

    /// Network or authentication failure while joining.
    #[error("Join failed: {0}")]
    JoinFailed(#[source] TransportError),

    /// The transport rejected the local tracks.
    #[error("Publish failed: {0}")]
    PublishFailed(#[source] TransportError),

    /// A remote track could not be subscribed.
    #[error("Subscribe to {participant_id} {kind} failed")]
    SubscribeFailed {
        participant_id: String,
        kind: MediaKind,
        #[source]
        source: TransportError,
    },

    /// The render surface does not resolve.
    #[error("Playback target invalid: {0:?}")]
    PlaybackTargetInvalid(String),

    /// Rendering failed for another reason.
    #[error("Playback failed: {0}")]
    Playback(#[source] TransportError),

    /// The track was closed; create new tracks instead.
    #[error("Track closed: {0}")]
    TrackClosed(String),

    /// Operation not valid in the current join state.
    #[error("Cannot {operation} while {}", .state.name())]
    InvalidState {
        operation: &'static str,
        state: JoinState,
    },

    /// Local tracks are already published to this channel.
    #[error("Local tracks already published")]
    AlreadyPublished,

    /// `init` has not created the client yet.
    #[error("Session not initialized")]
    NotInitialized,

    /// A leave superseded the operation.
    #[error("Cancelled by leave")]
    Cancelled,
}

impl SessionError {
    /// Whether the session stays usable after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::DeviceAcquisition(_) | Self::ClientCreation(_))
    }
}
