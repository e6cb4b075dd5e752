//! Connection state reporting.

use serde::{Deserialize, Serialize};

pub use rtc_ipc::ConnectionState;

/// One connectivity transition reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionChange {
    pub previous: ConnectionState,
    pub current: ConnectionState,

    /// Provider supplied reason, e.g. `LEAVE` or `NETWORK_ERROR`.
    pub reason: Option<String>,
}

impl ConnectionChange {
    pub fn new(previous: ConnectionState, current: ConnectionState, reason: Option<&str>) -> Self {
        Self {
            previous,
            current,
            reason: reason.map(str::to_string),
        }
    }

    /// True if the connection dropped to `Disconnected`.
    pub fn is_disconnect(&self) -> bool {
        self.current == ConnectionState::Disconnected
            && self.previous != ConnectionState::Disconnected
    }

    /// True if the disconnect was requested locally.
    pub fn is_requested(&self) -> bool {
        self.reason.as_deref() == Some("LEAVE")
    }
}
