//! Session state machine types.

use serde::{Deserialize, Serialize};

/// Where the session is in its join lifecycle.
///
/// `Idle -> Joining -> Joined -> Leaving -> Idle`. Leaving always returns to
/// `Idle`, so a session can join again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinState {
    /// Not in a channel.
    #[default]
    Idle,

    /// Waiting for the transport to acknowledge a join.
    Joining,

    /// In a channel.
    Joined,

    /// Releasing tracks and leaving the channel.
    Leaving,
}

impl JoinState {
    /// Returns true if the session is idle.
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Returns true if the session is joined.
    pub fn is_joined(self) -> bool {
        matches!(self, Self::Joined)
    }

    /// Returns true if remote events for the current channel should be applied.
    pub fn accepts_remote_events(self) -> bool {
        matches!(self, Self::Joining | Self::Joined)
    }

    /// Returns a simple string representation of the state.
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Joining => "Joining",
            Self::Joined => "Joined",
            Self::Leaving => "Leaving",
        }
    }
}

/// Transport connectivity as reported by the provider.
///
/// Observed read-only by the session; join state does not follow it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Get status message for UI.
    pub fn message(self) -> &'static str {
        match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Reconnecting => "Reconnecting...",
        }
    }
}

/// Observable session fields for UI binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    /// Join lifecycle state.
    pub join_state: JoinState,

    /// Both local capture tracks exist and are live.
    pub local_tracks_ready: bool,

    /// Local tracks have been published to the current channel.
    pub local_tracks_published: bool,

    /// A remote participant's video has been subscribed and played.
    pub remote_publish_observed: bool,

    /// Incremented on every join and leave; completions carrying an older
    /// value are stale.
    pub epoch: u64,
}

impl SessionStatus {
    pub fn is_joined(&self) -> bool {
        self.join_state.is_joined()
    }
}
