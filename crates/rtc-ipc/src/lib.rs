//! Typed host<->session messages for the RTC session core.
//!
//! This crate defines the message types and plain data shared between the
//! host application, the session engine and the transport contract.

mod commands;
mod events;
mod state;
mod types;

pub use commands::SessionCommand;
pub use events::SessionEvent;
pub use state::{ConnectionState, JoinState, SessionStatus};
pub use types::{
    AudioCaptureConfig, ClientMode, Device, DeviceKind, DeviceLists, FacingMode, FitMode,
    JoinParams, LogLevel, MediaKind, RenderOptions, SessionConfig, VideoCaptureConfig, VideoCodec,
};

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

/// Channel capacity for commands (host → session).
pub const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Channel capacity for events (session → host).
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Errors loading a [`SessionConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Malformed configuration.
    #[error("Invalid session config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Creates a bounded command channel.
pub fn command_channel() -> (
    tokio::sync::mpsc::Sender<SessionCommand>,
    tokio::sync::mpsc::Receiver<SessionCommand>,
) {
    tokio::sync::mpsc::channel(COMMAND_CHANNEL_CAPACITY)
}

/// Creates a bounded event channel.
pub fn event_channel() -> (Sender<SessionEvent>, Receiver<SessionEvent>) {
    crossbeam_channel::bounded(EVENT_CHANNEL_CAPACITY)
}
