//! Session coordinator for real-time audio/video channels.
//!
//! This crate sequences local capture, channel join, publishing and
//! remote-participant subscription over a [`rtc_transport::TransportProvider`],
//! and tears everything down again on leave.

mod bridge;
mod devices;
mod driver;
mod error;
mod participants;
mod session;
mod tracks;

pub use devices::DeviceRegistry;
pub use driver::SessionDriver;
pub use error::SessionError;
pub use participants::{ParticipantRegistry, RemoteParticipant};
pub use session::Session;
pub use tracks::{LocalTrack, LocalTracks, MediaTrackManager};

use std::sync::Arc;

use crossbeam_channel::Sender;
use rtc_ipc::{SessionCommand, SessionConfig, SessionEvent};
use rtc_transport::TransportProvider;
use tokio::sync::mpsc::Receiver;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Create a driver with IPC channels.
pub fn create_driver(
    provider: Arc<dyn TransportProvider>,
    config: SessionConfig,
    command_rx: Receiver<SessionCommand>,
    event_tx: Sender<SessionEvent>,
) -> SessionDriver {
    SessionDriver::new(provider, config, command_rx, event_tx)
}
