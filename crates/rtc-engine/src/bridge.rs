//! Event bridge from transport notifications to session updates.
//!
//! A single task drains the client's event stream and applies each
//! notification in arrival order, so registry updates have one writer.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use rtc_ipc::{MediaKind, SessionEvent};
use rtc_transport::{ConnectionChange, EventStream, TransportEvent};

use crate::error::SessionError;
use crate::session::{SessionInner, SessionRef};

/// Spawn the dispatcher loop. Ends when the stream closes or the session
/// is dropped.
pub(crate) fn spawn(session: SessionRef, mut stream: EventStream) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!("Event bridge started");
        while let Some(event) = stream.recv().await {
            let Some(inner) = session.upgrade() else {
                break;
            };
            dispatch(&inner, event).await;
        }
        debug!("Event bridge stopped");
    })
}

/// Apply one notification.
#[instrument(name = "bridge_dispatch", skip_all, fields(event = event.name()))]
pub(crate) async fn dispatch(inner: &SessionInner, event: TransportEvent) {
    match event {
        TransportEvent::ConnectionStateChange(change) => on_connection_change(inner, change),
        remote => dispatch_remote(inner, remote).await,
    }
}

/// Participant notifications only apply while joining or joined.
async fn dispatch_remote(inner: &SessionInner, event: TransportEvent) {
    let state = inner.status().join_state;
    if !state.accepts_remote_events() {
        debug!(state = state.name(), ?event, "Not in a channel, discarding");
        return;
    }

    match event {
        TransportEvent::UserJoined { participant_id } => on_user_joined(inner, participant_id),
        TransportEvent::UserLeft { participant_id } => on_user_left(inner, participant_id),
        TransportEvent::UserPublished {
            participant_id,
            kind,
        } => on_user_published(inner, participant_id, kind).await,
        TransportEvent::UserUnpublished {
            participant_id,
            kind,
        } => on_user_unpublished(inner, participant_id, kind),
        TransportEvent::ConnectionStateChange(change) => on_connection_change(inner, change),
    }
}

fn on_connection_change(inner: &SessionInner, change: ConnectionChange) {
    if change.is_disconnect() && !change.is_requested() {
        error!(reason = ?change.reason, "Transport disconnected");
        inner.send_event(SessionEvent::ConnectionLost {
            reason: change.reason.clone(),
        });
    } else {
        debug!(
            previous = change.previous.message(),
            current = change.current.message(),
            "Connection state changed"
        );
    }

    inner.send_event(SessionEvent::ConnectionStateChanged {
        previous: change.previous,
        current: change.current,
        reason: change.reason,
    });
}

fn on_user_joined(inner: &SessionInner, participant_id: String) {
    if !inner.participants.insert(&participant_id) {
        debug!(participant = %participant_id, "Duplicate join");
        return;
    }

    info!(participant = %participant_id, "Participant joined");
    inner.send_event(SessionEvent::ParticipantJoined { participant_id });
}

fn on_user_left(inner: &SessionInner, participant_id: String) {
    if inner.participants.remove(&participant_id).is_none() {
        debug!(participant = %participant_id, "Leave for unknown participant");
        return;
    }

    info!(participant = %participant_id, "Participant left");
    inner.send_event(SessionEvent::ParticipantLeft { participant_id });
}

async fn on_user_published(inner: &SessionInner, participant_id: String, kind: MediaKind) {
    let epoch = inner.status().epoch;

    // Unknown participants are either not announced yet or already gone.
    if !inner.participants.mark_published(&participant_id, kind) {
        debug!(participant = %participant_id, %kind, "Publish from unknown participant dropped");
        return;
    }

    let Ok(client) = inner.client() else {
        return;
    };

    let track = match client.subscribe(&participant_id, kind).await {
        Ok(track) => track,
        Err(source) => {
            inner.participants.forget_kind(&participant_id, kind);
            let cause = source.to_string();
            let err = SessionError::SubscribeFailed {
                participant_id,
                kind,
                source,
            };
            warn!(error = %err, %cause, "Subscribe failed");
            inner.send_event(SessionEvent::Error {
                recoverable: true,
                message: format!("{}: {}", err, cause),
            });
            return;
        }
    };

    if !inner.is_current(epoch) {
        debug!(participant = %participant_id, %kind, "Subscribe completed after leave, discarding");
        track.stop();
        return;
    }

    let (surface_id, options) = {
        let config = inner.config.read();
        let surface = match kind {
            MediaKind::Video => config.remote_surface_for(&participant_id).map(str::to_string),
            MediaKind::Audio => None,
        };
        (surface, config.remote_render)
    };

    let rendered = match (kind, surface_id.as_deref()) {
        (MediaKind::Video, None) => {
            warn!(participant = %participant_id, "No surface bound, remote video not rendered");
            false
        }
        (_, surface) => match inner.tracks.play(&track, surface, options).await {
            Ok(()) => true,
            Err(e) => {
                warn!(participant = %participant_id, %kind, error = %e, "Remote playback failed");
                inner.send_event(SessionEvent::Error {
                    recoverable: true,
                    message: e.to_string(),
                });
                false
            }
        },
    };

    if !inner.is_current(epoch)
        || !inner
            .participants
            .attach(&participant_id, kind, Arc::clone(&track))
    {
        debug!(participant = %participant_id, %kind, "Participant gone, discarding track");
        track.stop();
        return;
    }

    if rendered && kind == MediaKind::Video {
        inner.observe_remote_publish(epoch);
    }

    info!(participant = %participant_id, %kind, "Remote track subscribed");
    inner.send_event(SessionEvent::RemoteTrackSubscribed {
        participant_id,
        kind,
        surface_id,
    });
}

fn on_user_unpublished(inner: &SessionInner, participant_id: String, kind: MediaKind) {
    let Some(track) = inner.participants.unpublish(&participant_id, kind) else {
        debug!(participant = %participant_id, %kind, "Unpublish from unknown participant");
        return;
    };

    if let Some(track) = track {
        track.stop();
    }

    info!(participant = %participant_id, %kind, "Remote track unpublished");
    inner.send_event(SessionEvent::RemoteTrackUnpublished {
        participant_id,
        kind,
    });
}
