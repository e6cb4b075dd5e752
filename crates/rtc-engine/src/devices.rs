//! Device enumeration.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use rtc_ipc::{Device, DeviceLists};
use rtc_transport::TransportProvider;

use crate::error::SessionError;
use crate::SessionResult;

/// Enumerates capture and playback devices through the provider.
///
/// Nothing is cached: every call queries the platform again.
pub struct DeviceRegistry {
    provider: Arc<dyn TransportProvider>,
}

impl DeviceRegistry {
    pub fn new(provider: Arc<dyn TransportProvider>) -> Self {
        Self { provider }
    }

    /// Enumerate all devices in platform order.
    #[instrument(name = "enumerate_devices", skip(self))]
    pub async fn enumerate(&self) -> SessionResult<Vec<Device>> {
        let devices = self.provider.enumerate_devices().await.map_err(|e| {
            warn!(error = %e, "Device enumeration failed");
            SessionError::DeviceEnumeration(e)
        })?;

        debug!(count = devices.len(), "Enumerated devices");
        Ok(devices)
    }

    /// Enumerate and partition into audio-input, video-input and audio-output.
    pub async fn lists(&self) -> SessionResult<DeviceLists> {
        let devices = self.enumerate().await?;
        Ok(DeviceLists::partition(&devices))
    }
}
