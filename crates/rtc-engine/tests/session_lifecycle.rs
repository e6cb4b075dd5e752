//! End-to-end session scenarios over the loopback transport.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use tokio::time::timeout;

use rtc_engine::{create_driver, Session, SessionError};
use rtc_ipc::{
    command_channel, event_channel, ConnectionState, Device, DeviceKind, JoinParams, JoinState,
    MediaKind, SessionCommand, SessionConfig, SessionEvent, SessionStatus,
};
use rtc_transport::{LoopbackCall, LoopbackProvider, MediaTrack, TransportError};

const WAIT: Duration = Duration::from_secs(5);

fn params(user: &str) -> JoinParams {
    JoinParams::new("A1", "C1", Some("T1".to_string()), user)
}

fn new_session(provider: &LoopbackProvider) -> (Session, Receiver<SessionEvent>) {
    session_with(provider, SessionConfig::default())
}

fn session_with(
    provider: &LoopbackProvider,
    config: SessionConfig,
) -> (Session, Receiver<SessionEvent>) {
    let (event_tx, event_rx) = event_channel();
    let session = Session::new(Arc::new(provider.clone()), config, event_tx);
    (session, event_rx)
}

async fn wait_status(session: &Session, pred: impl Fn(&SessionStatus) -> bool) -> SessionStatus {
    let mut rx = session.watch_status();
    let status = timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for status")
        .expect("status channel closed")
        .clone();
    status
}

async fn wait_event(
    rx: &Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    timeout(WAIT, async {
        loop {
            while let Ok(event) = rx.try_recv() {
                if pred(&event) {
                    return event;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("timed out waiting for event")
}

async fn eventually(cond: impl Fn() -> bool) {
    timeout(WAIT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

fn position(journal: &[LoopbackCall], pred: impl Fn(&LoopbackCall) -> bool) -> Option<usize> {
    journal.iter().position(pred)
}

fn count(provider: &LoopbackProvider, pred: impl Fn(&LoopbackCall) -> bool) -> usize {
    provider.journal().iter().filter(|c| pred(c)).count()
}

fn is_publish(call: &LoopbackCall) -> bool {
    matches!(call, LoopbackCall::Publish { .. })
}

fn is_create_tracks(call: &LoopbackCall) -> bool {
    matches!(call, LoopbackCall::CreateTracks)
}

#[tokio::test]
async fn test_publish_waits_for_late_tracks() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    let gate = provider.hold_tracks();

    let (init, join) = tokio::join!(session.init(), async {
        let joined = session.join(params("U1")).await;
        assert!(session.is_joined());
        assert!(!session.is_local_track_ready());
        assert_eq!(count(&provider, is_publish), 0);
        gate.open();
        joined
    });
    init.unwrap();
    join.unwrap();

    let status = wait_status(&session, |s| s.local_tracks_published).await;
    assert!(status.is_joined());
    assert!(status.local_tracks_ready);

    let tracks = session.local_tracks().unwrap();
    assert!(tracks.audio.is_published());
    assert!(tracks.video.is_published());
}

#[tokio::test]
async fn test_publish_is_never_seen_before_join_completes() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    let gate = provider.hold_join();

    let pending = tokio::spawn(session.start_join(params("U1")).unwrap());
    tokio::task::yield_now().await;

    assert_eq!(session.join_state(), JoinState::Joining);
    assert!(matches!(
        session.publish().await,
        Err(SessionError::InvalidState { state: JoinState::Joining, .. })
    ));
    assert_eq!(count(&provider, is_publish), 0);

    gate.open();
    pending.await.unwrap().unwrap();
    wait_status(&session, |s| s.local_tracks_published).await;

    let journal = provider.journal();
    let joined = position(&journal, |c| matches!(c, LoopbackCall::Joined { .. })).unwrap();
    let published = position(&journal, is_publish).unwrap();
    assert!(joined < published);
    assert_eq!(count(&provider, is_publish), 1);
}

#[tokio::test]
async fn test_rejoin_uses_fresh_tracks() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();

    session.join(params("U1")).await.unwrap();
    wait_status(&session, |s| s.local_tracks_published).await;
    let first = session.local_tracks().unwrap();

    session.leave().await.unwrap();
    assert_eq!(session.join_state(), JoinState::Idle);
    assert!(!first.is_live());
    assert!(session.local_tracks().is_none());

    session.join(params("U1")).await.unwrap();
    let status = wait_status(&session, |s| s.local_tracks_published).await;
    assert!(status.is_joined());

    let second = session.local_tracks().unwrap();
    assert!(second.is_live());
    assert!(!Arc::ptr_eq(&first.audio, &second.audio));
    assert_ne!(first.video.id(), second.video.id());
    assert_eq!(provider.local_tracks().len(), 4);
}

#[tokio::test]
async fn test_leave_during_join_stays_idle() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    let gate = provider.hold_join();

    let pending = tokio::spawn(session.start_join(params("U1")).unwrap());
    tokio::task::yield_now().await;

    session.leave().await.unwrap();
    assert_eq!(session.join_state(), JoinState::Idle);

    gate.open();
    assert_eq!(pending.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(session.join_state(), JoinState::Idle);
    assert!(provider.members("C1").is_empty());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(count(&provider, is_publish), 0);
}

#[tokio::test]
async fn test_tracks_acquired_after_leave_are_released() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();
    wait_status(&session, |s| s.local_tracks_published).await;
    session.leave().await.unwrap();

    let gate = provider.hold_tracks();
    session.join(params("U1")).await.unwrap();
    eventually(|| count(&provider, is_create_tracks) == 2).await;
    session.leave().await.unwrap();
    gate.open();

    eventually(|| provider.local_tracks().len() == 4).await;
    eventually(|| provider.local_tracks().iter().all(|t| t.is_closed())).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert_eq!(session.join_state(), JoinState::Idle);
    assert!(session.local_tracks().is_none());
    assert!(!session.is_local_track_ready());
    assert_eq!(count(&provider, is_publish), 1);
}

#[tokio::test]
async fn test_leave_during_init_cancels_acquisition() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    let gate = provider.hold_tracks();

    let pending = tokio::spawn(session.start_init().unwrap());
    eventually(|| count(&provider, is_create_tracks) == 1).await;
    session.leave().await.unwrap();
    gate.open();

    assert_eq!(pending.await.unwrap(), Err(SessionError::Cancelled));
    assert!(provider.local_tracks().iter().all(|t| t.is_closed()));
    assert!(!session.is_local_track_ready());
}

#[tokio::test]
async fn test_failed_join_during_leave_stays_idle() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    let gate = provider.hold_join();
    provider.fail_next_join(TransportError::Network("timeout".to_string()));

    let pending = tokio::spawn(session.start_join(params("U1")).unwrap());
    tokio::task::yield_now().await;
    session.leave().await.unwrap();

    gate.open();
    assert_eq!(pending.await.unwrap(), Err(SessionError::Cancelled));
    assert_eq!(session.join_state(), JoinState::Idle);
}

#[tokio::test]
async fn test_join_failure_reverts_to_idle_without_retry() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    provider.fail_next_join(TransportError::AuthenticationFailed("bad token".to_string()));

    let err = session.join(params("U1")).await.unwrap_err();

    assert!(matches!(err, SessionError::JoinFailed(_)));
    assert_eq!(session.join_state(), JoinState::Idle);
    let attempts = count(&provider, |c| matches!(c, LoopbackCall::JoinRequested { .. }));
    assert_eq!(attempts, 1);

    session.join(params("U1")).await.unwrap();
    assert!(session.is_joined());
}

#[tokio::test]
async fn test_join_requires_idle_and_init() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);

    assert_eq!(
        session.join(params("U1")).await.unwrap_err(),
        SessionError::NotInitialized
    );

    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();
    assert!(matches!(
        session.join(params("U1")).await,
        Err(SessionError::InvalidState { state: JoinState::Joined, .. })
    ));
}

#[tokio::test]
async fn test_publish_failure_keeps_session_joined() {
    let provider = LoopbackProvider::new();
    let (session, events) = new_session(&provider);
    session.init().await.unwrap();
    provider.fail_next_publish(TransportError::Rejected("quota".to_string()));

    session.join(params("U1")).await.unwrap();
    let event = wait_event(&events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(matches!(event, SessionEvent::Error { recoverable: true, .. }));
    assert!(session.is_joined());
    assert!(!session.status().local_tracks_published);

    session.publish().await.unwrap();
    assert!(session.status().local_tracks_published);
    assert_eq!(session.publish().await, Err(SessionError::AlreadyPublished));
}

#[tokio::test]
async fn test_capture_denied_leaves_session_idle() {
    let provider = LoopbackProvider::new();
    provider.set_capture_denied(true);
    let (session, _events) = new_session(&provider);

    let err = session.init().await.unwrap_err();

    assert!(matches!(
        err,
        SessionError::DeviceAcquisition(TransportError::PermissionDenied(_))
    ));
    assert_eq!(session.join_state(), JoinState::Idle);
    assert!(!session.is_local_track_ready());
}

#[tokio::test]
async fn test_leave_is_idempotent() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();

    session.leave().await.unwrap();
    session.leave().await.unwrap();

    assert_eq!(session.join_state(), JoinState::Idle);
    assert!(!session.is_remote_publish_observed());
    let leaves = count(&provider, |c| matches!(c, LoopbackCall::Leave { .. }));
    assert_eq!(leaves, 1);
}

#[tokio::test]
async fn test_leave_before_join_releases_tracks() {
    let provider = LoopbackProvider::new();
    let (session, _events) = new_session(&provider);
    session.init().await.unwrap();

    session.leave().await.unwrap();

    assert!(provider.local_tracks().iter().all(|t| t.is_closed()));
    assert!(!session.is_local_track_ready());
}

#[tokio::test]
async fn test_get_devices_partitions() {
    let provider = LoopbackProvider::with_devices(vec![
        Device::new("mic-1", DeviceKind::AudioInput, "Built-in Microphone"),
        Device::new("cam-1", DeviceKind::VideoInput, "Camera"),
        Device::new("mic-2", DeviceKind::AudioInput, "Headset"),
        Device::new("spk-1", DeviceKind::AudioOutput, "Speakers"),
    ]);
    let (session, events) = new_session(&provider);

    let lists = session.get_devices().await.unwrap();

    assert_eq!(lists.audio_inputs.len(), 2);
    assert_eq!(lists.video_inputs.len(), 1);
    assert_eq!(lists.audio_outputs.len(), 1);
    assert_eq!(session.devices(), lists);
    assert!(matches!(events.try_recv(), Ok(SessionEvent::Devices(_))));
}

#[tokio::test]
async fn test_get_devices_failure() {
    let provider = LoopbackProvider::new();
    provider.fail_next_enumeration(TransportError::Enumeration("busy".to_string()));
    let (session, _events) = new_session(&provider);

    let err = session.get_devices().await.unwrap_err();
    assert!(matches!(err, SessionError::DeviceEnumeration(_)));
}

#[tokio::test]
async fn test_two_sessions_see_each_other() {
    let provider = LoopbackProvider::new();
    provider.register_surface("remote-bob");
    let (alice, _alice_events) = new_session(&provider);
    let (bob, _bob_events) = new_session(&provider);
    alice.bind_remote_surface("bob", "remote-bob");

    alice.init().await.unwrap();
    bob.init().await.unwrap();
    alice.join(params("alice")).await.unwrap();
    bob.join(params("bob")).await.unwrap();

    wait_status(&alice, |s| s.remote_publish_observed).await;
    let remote = alice.participant("bob").unwrap();
    assert!(remote.has_published(MediaKind::Video));
    assert!(remote.track(MediaKind::Video).unwrap().is_playing());

    // Bob has no surface for alice: subscribed, but video is not rendered.
    eventually(|| {
        bob.participant("alice")
            .map(|p| p.track(MediaKind::Audio).is_some())
            .unwrap_or(false)
    })
    .await;
    assert!(!bob.is_remote_publish_observed());

    bob.leave().await.unwrap();
    eventually(|| alice.participant_ids().is_empty()).await;
    assert!(alice.is_joined());
}

#[tokio::test]
async fn test_remote_unpublish_stops_playback() {
    let provider = LoopbackProvider::new();
    provider.register_surface("grid");
    let mut config = SessionConfig::default();
    config.default_remote_surface = Some("grid".to_string());
    let (session, events) = session_with(&provider, config);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();

    provider.remote_join("C1", "peer1");
    provider.remote_publish("C1", "peer1", MediaKind::Video);
    wait_event(&events, |e| {
        matches!(e, SessionEvent::RemoteTrackSubscribed { surface_id: Some(s), .. } if s == "grid")
    })
    .await;
    let track = session
        .participant("peer1")
        .and_then(|p| p.track(MediaKind::Video).cloned())
        .unwrap();
    assert!(track.is_playing());

    provider.remote_unpublish("C1", "peer1", MediaKind::Video);
    wait_event(&events, |e| matches!(e, SessionEvent::RemoteTrackUnpublished { .. })).await;

    assert!(!track.is_playing());
    let participant = session.participant("peer1").unwrap();
    assert!(!participant.has_published(MediaKind::Video));
}

#[tokio::test]
async fn test_subscribe_completing_after_leave_is_discarded() {
    let provider = LoopbackProvider::new();
    provider.register_surface("grid");
    let mut config = SessionConfig::default();
    config.default_remote_surface = Some("grid".to_string());
    let (session, events) = session_with(&provider, config);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();
    wait_event(&events, |e| {
        matches!(
            e,
            SessionEvent::ConnectionStateChanged {
                current: ConnectionState::Connected,
                ..
            }
        )
    })
    .await;

    let gate = provider.hold_subscribe();
    provider.remote_join("C1", "peer1");
    provider.remote_publish("C1", "peer1", MediaKind::Video);
    eventually(|| count(&provider, |c| matches!(c, LoopbackCall::Subscribe { .. })) == 1).await;

    session.leave().await.unwrap();
    gate.open();

    // The bridge handles our own disconnect only after the held subscribe.
    let mut subscribed = false;
    timeout(WAIT, async {
        loop {
            while let Ok(event) = events.try_recv() {
                match event {
                    SessionEvent::RemoteTrackSubscribed { .. } => subscribed = true,
                    SessionEvent::ConnectionStateChanged {
                        current: ConnectionState::Disconnected,
                        ..
                    } => return,
                    _ => {}
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("disconnect not reported");

    assert!(!subscribed);
    let remote = provider.remote_tracks();
    assert_eq!(remote.len(), 1);
    assert!(!remote[0].is_playing());
    assert!(!provider
        .journal()
        .iter()
        .any(|c| matches!(c, LoopbackCall::Play { track_id, .. } if track_id == remote[0].id())));
    assert!(session.participant_ids().is_empty());
    assert!(!session.is_remote_publish_observed());
    assert_eq!(session.join_state(), JoinState::Idle);
}

#[tokio::test]
async fn test_invalid_remote_surface_is_reported() {
    let provider = LoopbackProvider::new();
    let mut config = SessionConfig::default();
    config.default_remote_surface = Some("missing".to_string());
    let (session, events) = session_with(&provider, config);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();

    provider.remote_join("C1", "peer1");
    provider.remote_publish("C1", "peer1", MediaKind::Video);

    let event = wait_event(&events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert!(matches!(event, SessionEvent::Error { recoverable: true, .. }));
    assert!(session.is_joined());
    assert!(!session.is_remote_publish_observed());
}

#[tokio::test]
async fn test_connection_loss_is_observed_not_a_transition() {
    let provider = LoopbackProvider::new();
    let (session, events) = new_session(&provider);
    session.init().await.unwrap();
    session.join(params("U1")).await.unwrap();

    provider.drop_connection("C1", "NETWORK_ERROR");

    let event = wait_event(&events, |e| matches!(e, SessionEvent::ConnectionLost { .. })).await;
    assert_eq!(
        event,
        SessionEvent::ConnectionLost {
            reason: Some("NETWORK_ERROR".to_string())
        }
    );
    assert!(session.is_joined());
}

#[tokio::test]
async fn test_play_local() {
    let provider = LoopbackProvider::new();
    provider.register_surface("preview");
    let (session, _events) = new_session(&provider);

    session.play_local("preview").await.unwrap();
    let tracks = session.local_tracks().unwrap();
    assert!(tracks.video.is_playing());
    assert!(tracks.audio.is_playing());

    let (other, _other_events) = new_session(&provider);
    assert_eq!(
        other.play_local("nowhere").await,
        Err(SessionError::PlaybackTargetInvalid("nowhere".to_string()))
    );
}

#[tokio::test]
async fn test_drop_leaves_channel() {
    let provider = LoopbackProvider::new();
    {
        let (session, _events) = new_session(&provider);
        session.init().await.unwrap();
        session.join(params("U1")).await.unwrap();
        assert_eq!(provider.members("C1"), vec!["U1".to_string()]);
    }

    eventually(|| provider.members("C1").is_empty()).await;
    assert!(provider.local_tracks().iter().all(|t| t.is_closed()));
}

#[tokio::test]
async fn test_driver_runs_commands_and_leaves_on_shutdown() {
    let provider = LoopbackProvider::new();
    let (command_tx, command_rx) = command_channel();
    let (event_tx, events) = event_channel();
    let driver = create_driver(
        Arc::new(provider.clone()),
        SessionConfig::default(),
        command_rx,
        event_tx,
    );
    let running = tokio::spawn(driver.run());

    command_tx.send(SessionCommand::Init).await.unwrap();
    command_tx.send(SessionCommand::Join(params("U1"))).await.unwrap();
    wait_event(&events, |e| matches!(e, SessionEvent::Published)).await;

    command_tx.send(SessionCommand::GetStatus).await.unwrap();
    let status = wait_event(&events, |e| matches!(e, SessionEvent::Status(_))).await;
    let SessionEvent::Status(status) = status else {
        unreachable!()
    };
    assert!(status.is_joined());
    assert!(status.local_tracks_published);

    command_tx.send(SessionCommand::Shutdown).await.unwrap();
    running.await.unwrap();

    wait_event(&events, |e| matches!(e, SessionEvent::Shutdown)).await;
    assert!(provider.members("C1").is_empty());
}

#[tokio::test]
async fn test_driver_joins_while_tracks_pending() {
    let provider = LoopbackProvider::new();
    let (command_tx, command_rx) = command_channel();
    let (event_tx, events) = event_channel();
    let running = tokio::spawn(
        create_driver(
            Arc::new(provider.clone()),
            SessionConfig::default(),
            command_rx,
            event_tx,
        )
        .run(),
    );
    let gate = provider.hold_tracks();

    command_tx.send(SessionCommand::Init).await.unwrap();
    command_tx.send(SessionCommand::Join(params("U1"))).await.unwrap();
    eventually(|| count(&provider, |c| matches!(c, LoopbackCall::Joined { .. })) == 1).await;

    let journal = provider.journal();
    let requested = position(&journal, |c| matches!(c, LoopbackCall::JoinRequested { .. }));
    assert!(requested.is_some());
    assert_eq!(count(&provider, is_publish), 0);

    gate.open();
    wait_event(&events, |e| matches!(e, SessionEvent::Published)).await;

    command_tx.send(SessionCommand::Shutdown).await.unwrap();
    running.await.unwrap();
}

#[tokio::test]
async fn test_driver_leave_during_init_releases_tracks() {
    let provider = LoopbackProvider::new();
    let (command_tx, command_rx) = command_channel();
    let (event_tx, events) = event_channel();
    let running = tokio::spawn(
        create_driver(
            Arc::new(provider.clone()),
            SessionConfig::default(),
            command_rx,
            event_tx,
        )
        .run(),
    );
    let gate = provider.hold_tracks();

    command_tx.send(SessionCommand::Init).await.unwrap();
    command_tx.send(SessionCommand::Leave).await.unwrap();
    gate.open();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(provider.local_tracks().iter().all(|t| t.is_closed()));

    command_tx.send(SessionCommand::GetStatus).await.unwrap();
    command_tx.send(SessionCommand::Shutdown).await.unwrap();
    running.await.unwrap();

    let mut status = None;
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, SessionEvent::Error { .. }), "{event:?}");
        if let SessionEvent::Status(s) = event {
            status = Some(s);
        }
    }
    let status = status.expect("status not reported");
    assert!(status.join_state.is_idle());
    assert!(!status.local_tracks_ready);
}

#[tokio::test]
async fn test_driver_leave_aborts_pending_join() {
    let provider = LoopbackProvider::new();
    let (command_tx, command_rx) = command_channel();
    let (event_tx, events) = event_channel();
    let driver = create_driver(
        Arc::new(provider.clone()),
        SessionConfig::default(),
        command_rx,
        event_tx,
    );
    let running = tokio::spawn(driver.run());
    let gate = provider.hold_join();

    command_tx.send(SessionCommand::Init).await.unwrap();
    command_tx.send(SessionCommand::Join(params("U1"))).await.unwrap();
    command_tx.send(SessionCommand::Leave).await.unwrap();
    wait_event(&events, |e| {
        matches!(
            e,
            SessionEvent::StateChanged {
                previous: JoinState::Leaving,
                current: JoinState::Idle
            }
        )
    })
    .await;

    gate.open();
    eventually(|| count(&provider, |c| matches!(c, LoopbackCall::Joined { .. })) == 1).await;
    eventually(|| provider.members("C1").is_empty()).await;

    drop(command_tx);
    running.await.unwrap();
    assert_eq!(count(&provider, is_publish), 0);
}

#[tokio::test]
async fn test_driver_reports_command_errors() {
    let provider = LoopbackProvider::new();
    let (command_tx, command_rx) = command_channel();
    let (event_tx, events) = event_channel();
    let running = tokio::spawn(
        create_driver(
            Arc::new(provider),
            SessionConfig::default(),
            command_rx,
            event_tx,
        )
        .run(),
    );

    command_tx.send(SessionCommand::Publish).await.unwrap();
    let event = wait_event(&events, |e| matches!(e, SessionEvent::Error { .. })).await;
    assert_eq!(
        event,
        SessionEvent::Error {
            recoverable: true,
            message: "Cannot publish while Idle".to_string(),
        }
    );

    command_tx.send(SessionCommand::Shutdown).await.unwrap();
    running.await.unwrap();
}
