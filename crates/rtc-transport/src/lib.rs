//! Transport provider contract.
//!
//! This crate describes the real-time media engine the session core drives:
//! client creation, channel join/leave, publish/subscribe, local capture
//! tracks, device enumeration and the notifications the engine pushes back.
//! [`LoopbackProvider`] implements the contract in-process.

mod connection;
mod error;
mod loopback;
mod provider;

pub use connection::{ConnectionChange, ConnectionState};
pub use error::TransportError;
pub use loopback::{Gate, LoopbackCall, LoopbackClient, LoopbackProvider, LoopbackTrack};
pub use provider::{
    event_channel, ClientHandle, EventSink, EventStream, MediaTrack, TrackHandle,
    TransportClient, TransportEvent, TransportProvider,
};

/// Result type for transport operations.
pub type TransportResult<T> = Result<T, TransportError>;
