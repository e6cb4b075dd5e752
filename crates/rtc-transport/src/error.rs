//! Error types for the transport module.

use rtc_ipc::MediaKind;
use thiserror::Error;

/// Errors that can occur during transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Capture permission was denied by the user or platform.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// No capture device of the required kind.
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Device enumeration failed.
    #[error("Device enumeration failed: {0}")]
    Enumeration(String),

    /// Network failure.
    #[error("Network error: {0}")]
    Network(String),

    /// Authentication failed.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The provider rejected the request.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Participant is not in the channel.
    #[error("Unknown participant: {0}")]
    UnknownParticipant(String),

    /// Participant has not published this kind.
    #[error("Participant {participant_id} has not published {kind}")]
    NotPublished {
        participant_id: String,
        kind: MediaKind,
    },

    /// Render surface does not resolve.
    #[error("Render surface not found: {0}")]
    SurfaceNotFound(String),

    /// Track was closed and cannot be used again.
    #[error("Track closed: {0}")]
    TrackClosed(String),

    /// Not joined to a channel.
    #[error("Not joined")]
    NotJoined,

    /// Already joined to a channel.
    #[error("Already joined")]
    AlreadyJoined,

    /// Channel disconnected.
    #[error("Channel disconnected")]
    ChannelDisconnected,
}
