//! Session state machine.
//!
//! All join-state changes go through [`SessionInner::modify_status`], which
//! serializes read-then-write updates of the observable status. Join and
//! leave each advance an epoch; asynchronous completions (join
//! acknowledgement, publish, subscribe) carry the epoch they started in and
//! are discarded if it is no longer current.

use std::future::Future;
use std::sync::{Arc, Weak};

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn, Instrument};

use rtc_ipc::{DeviceLists, JoinParams, JoinState, SessionConfig, SessionEvent, SessionStatus};
use rtc_transport::{event_channel, ClientHandle, TrackHandle, TransportProvider};

use crate::bridge;
use crate::devices::DeviceRegistry;
use crate::error::SessionError;
use crate::participants::{ParticipantRegistry, RemoteParticipant};
use crate::tracks::{LocalTracks, MediaTrackManager};
use crate::SessionResult;

/// One user's real-time session: local capture, channel membership and
/// remote participants.
///
/// Dropping a session that is still in a channel releases its tracks and
/// leaves the channel in the background.
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    pub(crate) config: RwLock<SessionConfig>,
    provider: Arc<dyn TransportProvider>,
    client: Mutex<Option<ClientHandle>>,
    pub(crate) tracks: MediaTrackManager,
    pub(crate) participants: ParticipantRegistry,
    devices: DeviceRegistry,
    device_lists: RwLock<DeviceLists>,
    status: Mutex<SessionStatus>,
    status_tx: watch::Sender<SessionStatus>,
    event_tx: Sender<SessionEvent>,
    bridge: Mutex<Option<JoinHandle<()>>>,
    publishing: tokio::sync::Mutex<()>,
}

impl Session {
    /// Create an idle session. Nothing is acquired until [`Session::init`].
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        config: SessionConfig,
        event_tx: Sender<SessionEvent>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::default());

        Self {
            inner: Arc::new(SessionInner {
                config: RwLock::new(config),
                tracks: MediaTrackManager::new(Arc::clone(&provider)),
                devices: DeviceRegistry::new(Arc::clone(&provider)),
                provider,
                client: Mutex::new(None),
                participants: ParticipantRegistry::new(),
                device_lists: RwLock::new(DeviceLists::default()),
                status: Mutex::new(SessionStatus::default()),
                status_tx,
                event_tx,
                bridge: Mutex::new(None),
                publishing: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Apply the log level, create the client, register event handlers and
    /// acquire local tracks.
    ///
    /// The client and handlers are in place before track acquisition starts,
    /// so `join` may be called while tracks are still pending.
    pub async fn init(&self) -> SessionResult<()> {
        self.start_init()?.await
    }

    /// Create the client and register handlers now, and return track
    /// acquisition as a future.
    ///
    /// A `leave` while the future is pending cancels it and releases
    /// whatever it acquired.
    #[instrument(name = "session_init", skip(self))]
    pub fn start_init(
        &self,
    ) -> SessionResult<impl Future<Output = SessionResult<()>> + Send + 'static> {
        let inner = &self.inner;
        {
            let mut client = inner.client.lock();
            if client.is_none() {
                let config = inner.config.read().clone();
                inner.provider.set_log_level(config.log_level);

                let created = inner
                    .provider
                    .create_client(config.client_mode, config.codec)
                    .map_err(SessionError::ClientCreation)?;

                let (sink, stream) = event_channel();
                created.set_event_sink(sink);
                *inner.bridge.lock() = Some(bridge::spawn(Arc::downgrade(inner), stream));
                *client = Some(created);

                debug!(mode = ?config.client_mode, codec = ?config.codec, "Client created");
            }
        }

        let generation = inner.tracks.generation();
        let inner = Arc::clone(inner);
        let acquire = async move {
            inner.ensure_tracks(generation).await?;
            info!("Session initialized");
            Ok::<(), SessionError>(())
        };
        Ok(acquire.instrument(tracing::debug_span!("acquire_tracks")))
    }

    /// Join a channel. Valid only while idle.
    ///
    /// Once joined, publishing the local tracks is scheduled; it waits for
    /// track creation if that has not finished.
    pub async fn join(&self, params: JoinParams) -> SessionResult<()> {
        self.start_join(params)?.await
    }

    /// Move to `Joining` now and return the rest of the join as a future.
    ///
    /// Lets a caller hand the transport round-trip to another task while a
    /// later `leave` still observes the join as started.
    pub fn start_join(
        &self,
        params: JoinParams,
    ) -> SessionResult<impl Future<Output = SessionResult<()>> + Send + 'static> {
        let client = self.inner.client()?;
        let epoch = self
            .inner
            .begin("join", JoinState::is_idle, JoinState::Joining)?;

        let inner = Arc::clone(&self.inner);
        Ok(async move { inner.finish_join(client, params, epoch).await })
    }

    /// Publish local tracks. Valid only while joined and not yet published.
    ///
    /// A failure leaves the session joined so the caller can retry.
    pub async fn publish(&self) -> SessionResult<()> {
        self.inner.publish(None).await
    }

    /// Release local tracks, forget remote participants and leave the channel.
    ///
    /// Safe to call repeatedly. Aborts a pending join or publish: their
    /// completions are discarded.
    #[instrument(name = "session_leave", skip(self))]
    pub async fn leave(&self) -> SessionResult<()> {
        let inner = &self.inner;
        let epoch = match inner.begin(
            "leave",
            |state| matches!(state, JoinState::Joining | JoinState::Joined),
            JoinState::Leaving,
        ) {
            Ok(epoch) => epoch,
            Err(SessionError::InvalidState { state, .. }) => {
                debug!(state = state.name(), "Not in a channel");
                if state.is_idle() {
                    inner.release_local();
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        inner.release_local();

        let client = inner.client.lock().clone();
        if let Some(client) = client {
            if let Err(e) = client.leave().await {
                warn!(error = %e, "Transport leave failed");
            }
        }

        inner.complete(epoch, JoinState::Leaving, JoinState::Idle);
        info!("Left channel");
        Ok(())
    }

    /// Preview local capture: video into `surface_id`, audio to the default
    /// output. Creates tracks first if there are none.
    pub async fn play_local(&self, surface_id: &str) -> SessionResult<()> {
        let generation = self.inner.tracks.generation();
        let tracks = self.inner.ensure_tracks(generation).await?;
        let options = self.inner.config.read().local_render;

        self.inner
            .tracks
            .play(tracks.video.handle(), Some(surface_id), options)
            .await?;
        self.inner
            .tracks
            .play(tracks.audio.handle(), None, options)
            .await
    }

    /// Render any track. No-op if it is already playing.
    pub async fn play(&self, track: &TrackHandle, surface_id: Option<&str>) -> SessionResult<()> {
        let options = self.inner.config.read().local_render;
        self.inner.tracks.play(track, surface_id, options).await
    }

    /// Enumerate devices and store the partitioned lists.
    pub async fn get_devices(&self) -> SessionResult<DeviceLists> {
        let lists = self.inner.devices.lists().await?;
        *self.inner.device_lists.write() = lists.clone();
        self.inner.send_event(SessionEvent::Devices(lists.clone()));
        Ok(lists)
    }

    /// Render `participant_id`'s video into `surface_id` from now on.
    pub fn bind_remote_surface(&self, participant_id: &str, surface_id: &str) {
        self.inner
            .config
            .write()
            .remote_surfaces
            .insert(participant_id.to_string(), surface_id.to_string());
    }

    /// Current observable status.
    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    /// Receiver notified on every status change.
    pub fn watch_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.status_tx.subscribe()
    }

    pub fn join_state(&self) -> JoinState {
        self.status().join_state
    }

    pub fn is_joined(&self) -> bool {
        self.status().is_joined()
    }

    pub fn is_remote_publish_observed(&self) -> bool {
        self.status().remote_publish_observed
    }

    pub fn is_local_track_ready(&self) -> bool {
        self.status().local_tracks_ready
    }

    /// Device lists from the last [`Session::get_devices`].
    pub fn devices(&self) -> DeviceLists {
        self.inner.device_lists.read().clone()
    }

    /// Current live local tracks.
    pub fn local_tracks(&self) -> Option<LocalTracks> {
        self.inner.tracks.live()
    }

    /// Snapshot of a remote participant.
    pub fn participant(&self, participant_id: &str) -> Option<RemoteParticipant> {
        self.inner.participants.get(participant_id)
    }

    /// Ids of known remote participants, sorted.
    pub fn participant_ids(&self) -> Vec<String> {
        self.inner.participants.ids()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(bridge) = self.inner.bridge.lock().take() {
            bridge.abort();
        }

        let state = self.inner.status().join_state;
        if state.is_idle() {
            return;
        }

        warn!(state = state.name(), "Session dropped while in a channel, leaving");
        self.inner.release_local();
        self.inner.modify_status(|status| {
            status.join_state = JoinState::Idle;
            status.epoch += 1;
        });

        let client = self.inner.client.lock().clone();
        if let (Some(client), Ok(runtime)) = (client, tokio::runtime::Handle::try_current()) {
            runtime.spawn(async move {
                if let Err(e) = client.leave().await {
                    warn!(error = %e, "Transport leave on drop failed");
                }
            });
        }
    }
}

impl SessionInner {
    pub(crate) fn status(&self) -> SessionStatus {
        self.status.lock().clone()
    }

    /// Apply `f` to the status and publish the result, as one step.
    pub(crate) fn modify_status<R>(&self, f: impl FnOnce(&mut SessionStatus) -> R) -> R {
        let mut status = self.status.lock();
        let result = f(&mut status);
        self.status_tx.send_if_modified(|published| {
            if *published == *status {
                return false;
            }
            *published = status.clone();
            true
        });
        result
    }

    /// True if `epoch` is current and remote events still apply.
    pub(crate) fn is_current(&self, epoch: u64) -> bool {
        let status = self.status.lock();
        status.epoch == epoch && status.join_state.accepts_remote_events()
    }

    pub(crate) fn client(&self) -> SessionResult<ClientHandle> {
        self.client.lock().clone().ok_or(SessionError::NotInitialized)
    }

    /// Start a transition to `next` if the current state passes `allowed`.
    /// Returns the new epoch.
    fn begin(
        &self,
        operation: &'static str,
        allowed: fn(JoinState) -> bool,
        next: JoinState,
    ) -> SessionResult<u64> {
        let outcome = self.modify_status(|status| {
            if !allowed(status.join_state) {
                return Err(status.join_state);
            }
            let previous = std::mem::replace(&mut status.join_state, next);
            status.epoch += 1;
            if next == JoinState::Joining {
                status.local_tracks_published = false;
            }
            Ok((previous, status.epoch))
        });

        match outcome {
            Ok((previous, epoch)) => {
                self.state_changed(previous, next);
                Ok(epoch)
            }
            Err(state) => Err(SessionError::InvalidState { operation, state }),
        }
    }

    /// Finish a transition started by [`Self::begin`], unless superseded.
    fn complete(&self, epoch: u64, from: JoinState, to: JoinState) -> bool {
        let done = self.modify_status(|status| {
            if status.epoch != epoch || status.join_state != from {
                return false;
            }
            status.join_state = to;
            true
        });

        if done {
            self.state_changed(from, to);
        }
        done
    }

    fn state_changed(&self, previous: JoinState, current: JoinState) {
        debug!(
            previous = previous.name(),
            current = current.name(),
            "State transition"
        );
        self.send_event(SessionEvent::StateChanged { previous, current });
    }

    #[instrument(
        name = "session_join",
        skip(self, client, params),
        fields(channel = %params.channel, user = %params.user_id)
    )]
    async fn finish_join(
        self: Arc<Self>,
        client: ClientHandle,
        params: JoinParams,
        epoch: u64,
    ) -> SessionResult<()> {
        info!("Joining channel");

        match client.join(&params).await {
            Ok(()) => {
                if !self.complete(epoch, JoinState::Joining, JoinState::Joined) {
                    warn!("Join acknowledged after leave, leaving again");
                    if self.status().join_state.is_idle() {
                        if let Err(e) = client.leave().await {
                            warn!(error = %e, "Transport leave failed");
                        }
                    }
                    return Err(SessionError::Cancelled);
                }

                info!("Joined channel");
                self.schedule_publish(epoch);
                Ok(())
            }
            Err(e) => {
                if self.complete(epoch, JoinState::Joining, JoinState::Idle) {
                    error!(error = %e, "Join failed");
                    Err(SessionError::JoinFailed(e))
                } else {
                    debug!(error = %e, "Join failed after leave");
                    Err(SessionError::Cancelled)
                }
            }
        }
    }

    /// Publish in the background once tracks are ready. Failures are
    /// reported on the event channel.
    fn schedule_publish(self: &Arc<Self>, epoch: u64) {
        let inner = Arc::clone(self);
        let task = async move {
            match inner.publish(Some(epoch)).await {
                Ok(()) => {}
                Err(SessionError::Cancelled) => debug!("Scheduled publish cancelled"),
                Err(e) => {
                    warn!(error = %e, "Scheduled publish failed");
                    inner.send_event(SessionEvent::Error {
                        recoverable: e.is_recoverable(),
                        message: e.to_string(),
                    });
                }
            }
        };
        tokio::spawn(task.instrument(tracing::debug_span!("scheduled_publish", epoch)));
    }

    /// Check that publishing is allowed, returning the current epoch.
    fn publishable(&self, expected_epoch: Option<u64>) -> SessionResult<u64> {
        let status = self.status();
        if expected_epoch.is_some_and(|epoch| epoch != status.epoch) {
            return Err(SessionError::Cancelled);
        }
        if !status.join_state.is_joined() {
            return Err(SessionError::InvalidState {
                operation: "publish",
                state: status.join_state,
            });
        }
        if status.local_tracks_published {
            return Err(SessionError::AlreadyPublished);
        }
        Ok(status.epoch)
    }

    #[instrument(name = "session_publish", skip(self))]
    pub(crate) async fn publish(&self, expected_epoch: Option<u64>) -> SessionResult<()> {
        let epoch = self.publishable(expected_epoch)?;
        let _publishing = self.publishing.lock().await;
        // Read before the epoch check: a leave bumps the epoch first.
        let generation = self.tracks.generation();
        self.publishable(Some(epoch))?;

        let tracks = self.ensure_tracks(generation).await?;
        // Leave may have run while tracks were being acquired.
        self.publishable(Some(epoch))?;

        let client = self.client()?;
        client.publish(&tracks.handles()).await.map_err(|e| {
            warn!(error = %e, "Publish rejected");
            SessionError::PublishFailed(e)
        })?;

        let applied = self.modify_status(|status| {
            if status.epoch != epoch || !status.join_state.is_joined() {
                return false;
            }
            status.local_tracks_published = true;
            true
        });
        if !applied {
            return Err(SessionError::Cancelled);
        }

        tracks.set_published(true);
        info!("Local tracks published");
        self.send_event(SessionEvent::Published);
        Ok(())
    }

    /// Live local tracks, creating them (or waiting for a creation in
    /// flight) when needed. Cancelled by any release after `generation`.
    pub(crate) async fn ensure_tracks(&self, generation: u64) -> SessionResult<LocalTracks> {
        let (audio, video) = {
            let config = self.config.read();
            (config.audio.clone(), config.video.clone())
        };
        let tracks = self
            .tracks
            .create_tracks_since(generation, &audio, &video)
            .await?;

        // A release between creation and here must not leave the flag set.
        let newly_ready = self.modify_status(|status| {
            if !self.tracks.is_ready() {
                return false;
            }
            !std::mem::replace(&mut status.local_tracks_ready, true)
        });
        if newly_ready {
            self.send_event(SessionEvent::TracksReady);
        }
        Ok(tracks)
    }

    /// Close local tracks, drop remote participants and reset the flags.
    fn release_local(&self) {
        self.tracks.close_all();
        let dropped = self.participants.clear();
        if dropped > 0 {
            debug!(count = dropped, "Remote participants cleared");
        }

        self.modify_status(|status| {
            status.local_tracks_ready = false;
            status.local_tracks_published = false;
            status.remote_publish_observed = false;
        });
    }

    /// Record that remote video is being rendered, if `epoch` is current.
    pub(crate) fn observe_remote_publish(&self, epoch: u64) {
        self.modify_status(|status| {
            if status.epoch == epoch {
                status.remote_publish_observed = true;
            }
        });
    }

    pub(crate) fn send_event(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

/// Weak handle the event bridge holds so it never keeps a session alive.
pub(crate) type SessionRef = Weak<SessionInner>;
