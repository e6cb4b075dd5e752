//! Common types used across session messages.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ConfigError;

/// Kind of a media track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    /// Returns the wire name of this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of an enumerable input/output device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Microphone.
    #[serde(rename = "audioinput")]
    AudioInput,

    /// Camera.
    #[serde(rename = "videoinput")]
    VideoInput,

    /// Speaker or headset.
    #[serde(rename = "audiooutput")]
    AudioOutput,
}

/// A snapshot of one enumerable device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Platform device identifier.
    pub id: String,

    /// Device class.
    pub kind: DeviceKind,

    /// Human readable label (may be empty before permission is granted).
    pub label: String,
}

impl Device {
    pub fn new(id: impl Into<String>, kind: DeviceKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
        }
    }
}

/// Devices partitioned by kind, in enumeration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceLists {
    /// Microphones.
    pub audio_inputs: Vec<Device>,

    /// Cameras.
    pub video_inputs: Vec<Device>,

    /// Playback devices.
    pub audio_outputs: Vec<Device>,
}

impl DeviceLists {
    /// Partition an enumeration result into the three views.
    pub fn partition(devices: &[Device]) -> Self {
        let of_kind = |kind: DeviceKind| -> Vec<Device> {
            devices.iter().filter(|d| d.kind == kind).cloned().collect()
        };

        Self {
            audio_inputs: of_kind(DeviceKind::AudioInput),
            video_inputs: of_kind(DeviceKind::VideoInput),
            audio_outputs: of_kind(DeviceKind::AudioOutput),
        }
    }

    /// Total number of devices across all views.
    pub fn len(&self) -> usize {
        self.audio_inputs.len() + self.video_inputs.len() + self.audio_outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Parameters for joining a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinParams {
    /// Application identifier issued by the transport provider.
    pub app_id: String,

    /// Channel (room) name.
    pub channel: String,

    /// Authentication token, if the channel requires one.
    pub token: Option<String>,

    /// Local user identifier.
    pub user_id: String,
}

impl JoinParams {
    pub fn new(
        app_id: impl Into<String>,
        channel: impl Into<String>,
        token: Option<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            app_id: app_id.into(),
            channel: channel.into(),
            token,
            user_id: user_id.into(),
        }
    }
}

/// Microphone capture parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioCaptureConfig {
    /// Acoustic echo cancellation.
    pub echo_cancellation: bool,

    /// Automatic gain control.
    pub auto_gain_control: bool,

    /// Noise suppression.
    pub noise_suppression: bool,

    /// Microphone to use (None for the platform default).
    pub device_id: Option<String>,
}

impl Default for AudioCaptureConfig {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            auto_gain_control: true,
            noise_suppression: true,
            device_id: None,
        }
    }
}

/// Which camera to prefer on devices with more than one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front camera.
    #[default]
    User,

    /// Rear camera.
    Environment,
}

/// Camera capture parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoCaptureConfig {
    pub facing_mode: FacingMode,

    /// Camera to use (None for the platform default).
    pub device_id: Option<String>,
}

/// How video is scaled into its surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitMode {
    /// Letterbox, preserving the whole frame.
    #[default]
    Contain,

    /// Fill the surface, cropping the frame.
    Cover,
}

/// Rendering parameters for `play`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub fit: FitMode,
    pub mirror: bool,
}

/// Transport client mode.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientMode {
    /// Interactive live streaming.
    #[default]
    Live,

    /// Communication (everyone publishes).
    Rtc,
}

/// Video codec requested from the transport.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    Vp8,
}

/// Transport provider log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    /// Only errors are logged.
    #[default]
    Error,
    None,
}

/// Configuration for a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Verbosity applied to the transport provider on init.
    pub log_level: LogLevel,

    pub client_mode: ClientMode,

    pub codec: VideoCodec,

    /// Microphone capture parameters.
    pub audio: AudioCaptureConfig,

    /// Camera capture parameters.
    pub video: VideoCaptureConfig,

    /// Render options for the local preview.
    pub local_render: RenderOptions,

    /// Render options for remote video.
    pub remote_render: RenderOptions,

    /// Surface per remote participant id.
    pub remote_surfaces: HashMap<String, String>,

    /// Surface for remote participants without a binding.
    pub default_remote_surface: Option<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Error,
            client_mode: ClientMode::Live,
            codec: VideoCodec::H264,
            audio: AudioCaptureConfig::default(),
            video: VideoCaptureConfig::default(),
            local_render: RenderOptions::default(),
            remote_render: RenderOptions::default(),
            remote_surfaces: HashMap::new(),
            default_remote_surface: None,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from JSON. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Surface a remote participant's video should be rendered into.
    pub fn remote_surface_for(&self, participant_id: &str) -> Option<&str> {
        self.remote_surfaces
            .get(participant_id)
            .or(self.default_remote_surface.as_ref())
            .map(String::as_str)
    }
}
