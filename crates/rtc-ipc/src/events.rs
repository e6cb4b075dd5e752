//! Events sent from the session to the host.

use serde::{Deserialize, Serialize};

use crate::state::{ConnectionState, JoinState, SessionStatus};
use crate::types::{DeviceLists, MediaKind};

/// Events that the session can send to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    /// Join state has changed.
    StateChanged {
        previous: JoinState,
        current: JoinState,
    },

    /// Local capture tracks are created and live.
    TracksReady,

    /// Local tracks were published to the channel.
    Published,

    /// A remote participant entered the channel.
    ParticipantJoined { participant_id: String },

    /// A remote participant left the channel.
    ParticipantLeft { participant_id: String },

    /// A remote track was subscribed (and played, when a surface was bound).
    RemoteTrackSubscribed {
        participant_id: String,
        kind: MediaKind,
        surface_id: Option<String>,
    },

    /// A remote participant stopped publishing a kind.
    RemoteTrackUnpublished {
        participant_id: String,
        kind: MediaKind,
    },

    /// Raw transport connectivity changed.
    ConnectionStateChanged {
        previous: ConnectionState,
        current: ConnectionState,
        reason: Option<String>,
    },

    /// The transport reported a disconnect.
    ConnectionLost { reason: Option<String> },

    /// Result of a device enumeration.
    Devices(DeviceLists),

    /// Current observable status.
    Status(SessionStatus),

    /// An operation failed.
    Error {
        /// Whether the session can continue (e.g. retry publish).
        recoverable: bool,

        /// Error message.
        message: String,
    },

    /// The driver has shut down.
    Shutdown,
}
