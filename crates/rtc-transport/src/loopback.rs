//! In-process transport.
//!
//! Every client created by one [`LoopbackProvider`] shares the same set of
//! channels, so sessions on the same provider see each other join, publish
//! and leave. Remote peers without a client can be simulated, and the
//! provider can be scripted to hold or fail individual calls. Each call is
//! recorded in an ordered journal.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, instrument, trace, warn};

use rtc_ipc::{
    AudioCaptureConfig, ClientMode, ConnectionState, Device, DeviceKind, JoinParams, LogLevel,
    MediaKind, RenderOptions, VideoCaptureConfig, VideoCodec,
};

use crate::connection::ConnectionChange;
use crate::error::TransportError;
use crate::provider::{
    ClientHandle, EventSink, MediaTrack, TrackHandle, TransportClient, TransportEvent,
    TransportProvider,
};
use crate::TransportResult;

/// A latch that holds callers until it is opened. Stays open afterwards.
#[derive(Debug, Clone)]
pub struct Gate {
    open: Arc<watch::Sender<bool>>,
}

impl Gate {
    /// Create a closed gate.
    pub fn closed() -> Self {
        let (open, _) = watch::channel(false);
        Self {
            open: Arc::new(open),
        }
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        self.open.send_replace(true);
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Wait until the gate is opened.
    pub async fn wait(&self) {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so this only returns once opened.
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// One call observed by the loopback transport, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopbackCall {
    SetLogLevel(LogLevel),
    CreateClient { client: u64 },
    CreateTracks,
    EnumerateDevices,
    JoinRequested { user_id: String, channel: String },
    Joined { user_id: String, channel: String },
    JoinFailed { user_id: String },
    Publish { user_id: String, track_ids: Vec<String> },
    Subscribe {
        user_id: String,
        participant_id: String,
        kind: MediaKind,
    },
    Play {
        track_id: String,
        surface_id: Option<String>,
    },
    Close { track_id: String },
    Leave { user_id: String },
}

struct Member {
    user_id: String,
    client: Option<Weak<LoopbackClient>>,
    published: BTreeSet<MediaKind>,
}

impl Member {
    fn client(&self) -> Option<Arc<LoopbackClient>> {
        self.client.as_ref().and_then(Weak::upgrade)
    }
}

struct Shared {
    log_level: Mutex<LogLevel>,
    devices: Mutex<Vec<Device>>,
    capture_denied: AtomicBool,
    surfaces: Mutex<HashSet<String>>,
    track_gate: Mutex<Option<Gate>>,
    join_gate: Mutex<Option<Gate>>,
    subscribe_gate: Mutex<Option<Gate>>,
    join_failure: Mutex<Option<TransportError>>,
    publish_failure: Mutex<Option<TransportError>>,
    enumeration_failure: Mutex<Option<TransportError>>,
    subscribe_failures: Mutex<HashSet<String>>,
    rooms: Mutex<HashMap<String, Vec<Member>>>,
    local_tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
    remote_tracks: Mutex<Vec<Arc<LoopbackTrack>>>,
    journal: Mutex<Vec<LoopbackCall>>,
    next_id: AtomicU64,
}

impl Shared {
    fn record(&self, call: LoopbackCall) {
        trace!(?call, "loopback call");
        self.journal.lock().push(call);
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Clients in `channel`, excluding `except`.
    fn peers(&self, channel: &str, except: &str) -> Vec<Arc<LoopbackClient>> {
        self.rooms
            .lock()
            .get(channel)
            .map(|members| {
                members
                    .iter()
                    .filter(|m| m.user_id != except)
                    .filter_map(Member::client)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-process [`TransportProvider`].
#[derive(Clone)]
pub struct LoopbackProvider {
    shared: Arc<Shared>,
}

impl LoopbackProvider {
    /// Create a provider with one microphone, one camera and one speaker.
    pub fn new() -> Self {
        Self::with_devices(vec![
            Device::new("default-mic", DeviceKind::AudioInput, "Default Microphone"),
            Device::new("default-cam", DeviceKind::VideoInput, "Default Camera"),
            Device::new("default-speaker", DeviceKind::AudioOutput, "Default Speaker"),
        ])
    }

    /// Create a provider exposing the given devices.
    pub fn with_devices(devices: Vec<Device>) -> Self {
        Self {
            shared: Arc::new(Shared {
                log_level: Mutex::new(LogLevel::default()),
                devices: Mutex::new(devices),
                capture_denied: AtomicBool::new(false),
                surfaces: Mutex::new(HashSet::new()),
                track_gate: Mutex::new(None),
                join_gate: Mutex::new(None),
                subscribe_gate: Mutex::new(None),
                join_failure: Mutex::new(None),
                publish_failure: Mutex::new(None),
                enumeration_failure: Mutex::new(None),
                subscribe_failures: Mutex::new(HashSet::new()),
                rooms: Mutex::new(HashMap::new()),
                local_tracks: Mutex::new(Vec::new()),
                remote_tracks: Mutex::new(Vec::new()),
                journal: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Make a render surface resolvable.
    pub fn register_surface(&self, surface_id: impl Into<String>) {
        self.shared.surfaces.lock().insert(surface_id.into());
    }

    /// Deny (or re-allow) capture permission.
    pub fn set_capture_denied(&self, denied: bool) {
        self.shared.capture_denied.store(denied, Ordering::SeqCst);
    }

    /// Hold track creation until the returned gate is opened.
    pub fn hold_tracks(&self) -> Gate {
        let gate = Gate::closed();
        *self.shared.track_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold join acknowledgement until the returned gate is opened.
    pub fn hold_join(&self) -> Gate {
        let gate = Gate::closed();
        *self.shared.join_gate.lock() = Some(gate.clone());
        gate
    }

    /// Hold subscribe results until the returned gate is opened. The remote
    /// track is created before the wait.
    pub fn hold_subscribe(&self) -> Gate {
        let gate = Gate::closed();
        *self.shared.subscribe_gate.lock() = Some(gate.clone());
        gate
    }

    /// Fail the next join with `error`.
    pub fn fail_next_join(&self, error: TransportError) {
        *self.shared.join_failure.lock() = Some(error);
    }

    /// Fail the next publish with `error`.
    pub fn fail_next_publish(&self, error: TransportError) {
        *self.shared.publish_failure.lock() = Some(error);
    }

    /// Fail the next device enumeration with `error`.
    pub fn fail_next_enumeration(&self, error: TransportError) {
        *self.shared.enumeration_failure.lock() = Some(error);
    }

    /// Reject every subscribe to `participant_id`.
    pub fn fail_subscribe(&self, participant_id: impl Into<String>) {
        self.shared
            .subscribe_failures
            .lock()
            .insert(participant_id.into());
    }

    /// Ordered record of calls made so far.
    pub fn journal(&self) -> Vec<LoopbackCall> {
        self.shared.journal.lock().clone()
    }

    /// Current engine log level.
    pub fn log_level(&self) -> LogLevel {
        *self.shared.log_level.lock()
    }

    /// Every local capture track created so far.
    pub fn local_tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        self.shared.local_tracks.lock().clone()
    }

    /// Every remote track handed out by a subscribe.
    pub fn remote_tracks(&self) -> Vec<Arc<LoopbackTrack>> {
        self.shared.remote_tracks.lock().clone()
    }

    /// User ids currently in `channel`.
    pub fn members(&self, channel: &str) -> Vec<String> {
        self.shared
            .rooms
            .lock()
            .get(channel)
            .map(|members| members.iter().map(|m| m.user_id.clone()).collect())
            .unwrap_or_default()
    }

    /// Simulate a remote peer (without a client) entering `channel`.
    pub fn remote_join(&self, channel: &str, participant_id: &str) {
        {
            let mut rooms = self.shared.rooms.lock();
            let members = rooms.entry(channel.to_string()).or_default();
            if members.iter().any(|m| m.user_id == participant_id) {
                return;
            }
            members.push(Member {
                user_id: participant_id.to_string(),
                client: None,
                published: BTreeSet::new(),
            });
        }
        self.broadcast(
            channel,
            participant_id,
            TransportEvent::UserJoined {
                participant_id: participant_id.to_string(),
            },
        );
    }

    /// Simulate a remote peer publishing `kind`.
    pub fn remote_publish(&self, channel: &str, participant_id: &str, kind: MediaKind) {
        self.set_remote_published(channel, participant_id, kind, true);
        self.broadcast(
            channel,
            participant_id,
            TransportEvent::UserPublished {
                participant_id: participant_id.to_string(),
                kind,
            },
        );
    }

    /// Simulate a remote peer unpublishing `kind`.
    pub fn remote_unpublish(&self, channel: &str, participant_id: &str, kind: MediaKind) {
        self.set_remote_published(channel, participant_id, kind, false);
        self.broadcast(
            channel,
            participant_id,
            TransportEvent::UserUnpublished {
                participant_id: participant_id.to_string(),
                kind,
            },
        );
    }

    /// Simulate a remote peer leaving `channel`.
    pub fn remote_leave(&self, channel: &str, participant_id: &str) {
        if let Some(members) = self.shared.rooms.lock().get_mut(channel) {
            members.retain(|m| m.user_id != participant_id);
        }
        self.broadcast(
            channel,
            participant_id,
            TransportEvent::UserLeft {
                participant_id: participant_id.to_string(),
            },
        );
    }

    /// Deliver `event` verbatim to every client in `channel`.
    pub fn inject(&self, channel: &str, event: TransportEvent) {
        for client in self.shared.peers(channel, "") {
            client.emit(event.clone());
        }
    }

    /// Report a network drop to every client in `channel`.
    pub fn drop_connection(&self, channel: &str, reason: &str) {
        for client in self.shared.peers(channel, "") {
            client.set_connection(ConnectionState::Disconnected, Some(reason));
        }
    }

    fn set_remote_published(&self, channel: &str, participant_id: &str, kind: MediaKind, on: bool) {
        let mut rooms = self.shared.rooms.lock();
        let member = rooms
            .get_mut(channel)
            .and_then(|members| members.iter_mut().find(|m| m.user_id == participant_id));
        if let Some(member) = member {
            if on {
                member.published.insert(kind);
            } else {
                member.published.remove(&kind);
            }
        }
    }

    fn broadcast(&self, channel: &str, from: &str, event: TransportEvent) {
        for client in self.shared.peers(channel, from) {
            client.emit(event.clone());
        }
    }
}

impl Default for LoopbackProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportProvider for LoopbackProvider {
    fn set_log_level(&self, level: LogLevel) {
        *self.shared.log_level.lock() = level;
        self.shared.record(LoopbackCall::SetLogLevel(level));
    }

    fn create_client(&self, mode: ClientMode, codec: VideoCodec) -> TransportResult<ClientHandle> {
        let id = self.shared.next_id();
        self.shared.record(LoopbackCall::CreateClient { client: id });
        debug!(client = id, ?mode, ?codec, "Loopback client created");

        let shared = Arc::clone(&self.shared);
        let client: Arc<LoopbackClient> = Arc::new_cyclic(|me| LoopbackClient {
            id,
            me: me.clone(),
            shared,
            sink: Mutex::new(None),
            membership: Mutex::new(None),
            connection: Mutex::new(ConnectionState::Disconnected),
        });
        Ok(client as ClientHandle)
    }

    #[instrument(name = "loopback_create_tracks", skip_all)]
    async fn create_microphone_and_camera_tracks(
        &self,
        audio: &AudioCaptureConfig,
        video: &VideoCaptureConfig,
    ) -> TransportResult<(TrackHandle, TrackHandle)> {
        self.shared.record(LoopbackCall::CreateTracks);

        let gate = self.shared.track_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        if self.shared.capture_denied.load(Ordering::SeqCst) {
            return Err(TransportError::PermissionDenied(
                "microphone and camera".to_string(),
            ));
        }

        let (mic, cam) = {
            let devices = self.shared.devices.lock();
            let pick = |kind: DeviceKind, wanted: &Option<String>| {
                devices
                    .iter()
                    .filter(|d| d.kind == kind)
                    .find(|d| wanted.as_ref().map_or(true, |id| &d.id == id))
                    .map(|d| d.id.clone())
            };
            (
                pick(DeviceKind::AudioInput, &audio.device_id),
                pick(DeviceKind::VideoInput, &video.device_id),
            )
        };
        let mic = mic.ok_or_else(|| TransportError::DeviceNotFound("audioinput".to_string()))?;
        let cam = cam.ok_or_else(|| TransportError::DeviceNotFound("videoinput".to_string()))?;

        let n = self.shared.next_id();
        let audio_track = LoopbackTrack::new(&self.shared, MediaKind::Audio, format!("{mic}-{n}"));
        let video_track = LoopbackTrack::new(&self.shared, MediaKind::Video, format!("{cam}-{n}"));
        {
            let mut tracks = self.shared.local_tracks.lock();
            tracks.push(Arc::clone(&audio_track));
            tracks.push(Arc::clone(&video_track));
        }

        info!(audio = %audio_track.id, video = %video_track.id, "Loopback tracks created");
        Ok((audio_track as TrackHandle, video_track as TrackHandle))
    }

    async fn enumerate_devices(&self) -> TransportResult<Vec<Device>> {
        self.shared.record(LoopbackCall::EnumerateDevices);
        let failure = self.shared.enumeration_failure.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }
        Ok(self.shared.devices.lock().clone())
    }
}

/// Client created by a [`LoopbackProvider`].
pub struct LoopbackClient {
    id: u64,
    me: Weak<LoopbackClient>,
    shared: Arc<Shared>,
    sink: Mutex<Option<EventSink>>,
    membership: Mutex<Option<(String, String)>>,
    connection: Mutex<ConnectionState>,
}

impl LoopbackClient {
    /// Provider assigned client id.
    pub fn id(&self) -> u64 {
        self.id
    }

    fn emit(&self, event: TransportEvent) {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                if sink.send(event).is_err() {
                    debug!(client = self.id, "Event sink closed");
                }
            }
            None => trace!(client = self.id, ?event, "No event sink registered"),
        }
    }

    fn set_connection(&self, current: ConnectionState, reason: Option<&str>) {
        let previous = std::mem::replace(&mut *self.connection.lock(), current);
        if previous != current {
            self.emit(TransportEvent::ConnectionStateChange(ConnectionChange::new(
                previous, current, reason,
            )));
        }
    }

    fn user_id(&self) -> String {
        self.membership
            .lock()
            .as_ref()
            .map(|(_, user)| user.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TransportClient for LoopbackClient {
    fn set_event_sink(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    fn is_joined(&self) -> bool {
        self.membership.lock().is_some()
    }

    #[instrument(name = "loopback_join", skip(self, params), fields(client = self.id, channel = %params.channel))]
    async fn join(&self, params: &JoinParams) -> TransportResult<()> {
        self.shared.record(LoopbackCall::JoinRequested {
            user_id: params.user_id.clone(),
            channel: params.channel.clone(),
        });

        if self.is_joined() {
            return Err(TransportError::AlreadyJoined);
        }

        self.set_connection(ConnectionState::Connecting, None);

        let gate = self.shared.join_gate.lock().clone();
        if let Some(gate) = gate {
            gate.wait().await;
        }

        let failure = self.shared.join_failure.lock().take();
        if let Some(error) = failure {
            warn!(%error, "Loopback join failed");
            self.set_connection(ConnectionState::Disconnected, Some("JOIN_FAILED"));
            self.shared.record(LoopbackCall::JoinFailed {
                user_id: params.user_id.clone(),
            });
            return Err(error);
        }

        // Snapshot of everyone already in the channel, for this client.
        let existing: Vec<(String, Vec<MediaKind>)> = {
            let mut rooms = self.shared.rooms.lock();
            let members = rooms.entry(params.channel.clone()).or_default();
            let existing = members
                .iter()
                .map(|m| (m.user_id.clone(), m.published.iter().copied().collect()))
                .collect();
            members.retain(|m| m.user_id != params.user_id);
            members.push(Member {
                user_id: params.user_id.clone(),
                client: Some(self.me.clone()),
                published: BTreeSet::new(),
            });
            existing
        };
        *self.membership.lock() = Some((params.channel.clone(), params.user_id.clone()));

        self.set_connection(ConnectionState::Connected, None);
        self.shared.record(LoopbackCall::Joined {
            user_id: params.user_id.clone(),
            channel: params.channel.clone(),
        });

        for peer in self.shared.peers(&params.channel, &params.user_id) {
            peer.emit(TransportEvent::UserJoined {
                participant_id: params.user_id.clone(),
            });
        }
        for (participant_id, kinds) in existing {
            if participant_id == params.user_id {
                continue;
            }
            self.emit(TransportEvent::UserJoined {
                participant_id: participant_id.clone(),
            });
            for kind in kinds {
                self.emit(TransportEvent::UserPublished {
                    participant_id: participant_id.clone(),
                    kind,
                });
            }
        }

        Ok(())
    }

    async fn publish(&self, tracks: &[TrackHandle]) -> TransportResult<()> {
        let user_id = self.user_id();
        self.shared.record(LoopbackCall::Publish {
            user_id: user_id.clone(),
            track_ids: tracks.iter().map(|t| t.id().to_string()).collect(),
        });

        let (channel, user_id) = self
            .membership
            .lock()
            .clone()
            .ok_or(TransportError::NotJoined)?;

        if let Some(closed) = tracks.iter().find(|t| t.is_closed()) {
            return Err(TransportError::TrackClosed(closed.id().to_string()));
        }

        let failure = self.shared.publish_failure.lock().take();
        if let Some(error) = failure {
            return Err(error);
        }

        let kinds: Vec<MediaKind> = tracks.iter().map(|t| t.kind()).collect();
        {
            let mut rooms = self.shared.rooms.lock();
            let member = rooms
                .get_mut(&channel)
                .and_then(|members| members.iter_mut().find(|m| m.user_id == user_id));
            if let Some(member) = member {
                member.published.extend(kinds.iter().copied());
            }
        }

        for peer in self.shared.peers(&channel, &user_id) {
            for kind in &kinds {
                peer.emit(TransportEvent::UserPublished {
                    participant_id: user_id.clone(),
                    kind: *kind,
                });
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> TransportResult<TrackHandle> {
        self.shared.record(LoopbackCall::Subscribe {
            user_id: self.user_id(),
            participant_id: participant_id.to_string(),
            kind,
        });

        let (channel, _) = self
            .membership
            .lock()
            .clone()
            .ok_or(TransportError::NotJoined)?;

        if self.shared.subscribe_failures.lock().contains(participant_id) {
            return Err(TransportError::Rejected(format!(
                "subscribe to {participant_id} refused"
            )));
        }

        let published = {
            let rooms = self.shared.rooms.lock();
            rooms
                .get(&channel)
                .and_then(|members| members.iter().find(|m| m.user_id == participant_id))
                .map(|m| m.published.contains(&kind))
        };
        match published {
            None => Err(TransportError::UnknownParticipant(participant_id.to_string())),
            Some(false) => Err(TransportError::NotPublished {
                participant_id: participant_id.to_string(),
                kind,
            }),
            Some(true) => {
                let id = format!("remote-{participant_id}-{kind}-{}", self.shared.next_id());
                let track = LoopbackTrack::new(&self.shared, kind, id);
                self.shared.remote_tracks.lock().push(Arc::clone(&track));

                let gate = self.shared.subscribe_gate.lock().clone();
                if let Some(gate) = gate {
                    gate.wait().await;
                }
                Ok(track as TrackHandle)
            }
        }
    }

    async fn leave(&self) -> TransportResult<()> {
        let membership = self.membership.lock().take();
        let Some((channel, user_id)) = membership else {
            self.shared.record(LoopbackCall::Leave {
                user_id: String::new(),
            });
            return Ok(());
        };
        self.shared.record(LoopbackCall::Leave {
            user_id: user_id.clone(),
        });

        if let Some(members) = self.shared.rooms.lock().get_mut(&channel) {
            members.retain(|m| m.user_id != user_id);
        }
        for peer in self.shared.peers(&channel, &user_id) {
            peer.emit(TransportEvent::UserLeft {
                participant_id: user_id.clone(),
            });
        }

        self.set_connection(ConnectionState::Disconnected, Some("LEAVE"));
        Ok(())
    }
}

/// Track created by the loopback transport.
#[derive(Debug)]
pub struct LoopbackTrack {
    id: String,
    kind: MediaKind,
    shared: Weak<Shared>,
    playing: AtomicBool,
    closed: AtomicBool,
    surface: Mutex<Option<String>>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}

impl LoopbackTrack {
    fn new(shared: &Arc<Shared>, kind: MediaKind, id: String) -> Arc<Self> {
        Arc::new(Self {
            id,
            kind,
            shared: Arc::downgrade(shared),
            playing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            surface: Mutex::new(None),
        })
    }

    /// Surface the track is currently rendered into.
    pub fn surface(&self) -> Option<String> {
        self.surface.lock().clone()
    }
}

#[async_trait]
impl MediaTrack for LoopbackTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn play(&self, surface_id: Option<&str>, _options: RenderOptions) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::TrackClosed(self.id.clone()));
        }

        let shared = self
            .shared
            .upgrade()
            .ok_or(TransportError::ChannelDisconnected)?;

        match (self.kind, surface_id) {
            (_, Some(surface)) if !shared.surfaces.lock().contains(surface) => {
                return Err(TransportError::SurfaceNotFound(surface.to_string()));
            }
            (MediaKind::Video, None) => {
                return Err(TransportError::SurfaceNotFound(String::new()));
            }
            _ => {}
        }

        *self.surface.lock() = surface_id.map(str::to_string);
        self.playing.store(true, Ordering::SeqCst);
        shared.record(LoopbackCall::Play {
            track_id: self.id.clone(),
            surface_id: surface_id.map(str::to_string),
        });
        Ok(())
    }

    fn stop(&self) {
        self.playing.store(false, Ordering::SeqCst);
        *self.surface.lock() = None;
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stop();
        if let Some(shared) = self.shared.upgrade() {
            shared.record(LoopbackCall::Close {
                track_id: self.id.clone(),
            });
        }
    }
}
