//! Commands sent from the host to the session.

use serde::{Deserialize, Serialize};

use crate::types::JoinParams;

/// Commands that the host can send to the session driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionCommand {
    /// Create the client, local tracks and event handlers.
    Init,

    /// Join a channel; local tracks are published once joined.
    Join(JoinParams),

    /// Retry publishing local tracks.
    Publish,

    /// Leave the channel and release local tracks.
    Leave,

    /// Play the local preview into a surface.
    PlayLocal { surface_id: String },

    /// Render a remote participant's video into a surface.
    BindRemoteSurface {
        participant_id: String,
        surface_id: String,
    },

    /// Request the partitioned device lists.
    GetDevices,

    /// Request the current observable status.
    GetStatus,

    /// Leave (if needed) and stop the driver.
    Shutdown,
}
