//! Runs a session against a simulated remote peer on the loopback
//! transport.
//!
//! Usage: `rtc-demo [config.json]`. Join parameters come from
//! `RTC_APP_ID`, `RTC_CHANNEL`, `RTC_TOKEN` and `RTC_USER_ID`.

mod host;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use rtc_engine::{create_driver, Session};
use rtc_ipc::{command_channel, event_channel, JoinParams, MediaKind, SessionConfig, SessionEvent};
use rtc_transport::LoopbackProvider;

use host::Host;

const LOCAL_SURFACE: &str = "local-preview";
const REMOTE_SURFACE: &str = "remote-grid";
const PEER_ID: &str = "peer-1";
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "rtc_demo=debug,rtc_engine=debug,rtc_transport=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config() -> Result<SessionConfig> {
    let mut config = match std::env::args().nth(1) {
        Some(path) => {
            let json = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config {}", path))?;
            SessionConfig::from_json_str(&json)
                .with_context(|| format!("Invalid config {}", path))?
        }
        None => SessionConfig::default(),
    };

    if config.default_remote_surface.is_none() {
        config.default_remote_surface = Some(REMOTE_SURFACE.to_string());
    }
    Ok(config)
}

fn join_params() -> JoinParams {
    let var = |name: &str, default: &str| std::env::var(name).unwrap_or_else(|_| default.to_string());
    JoinParams::new(
        var("RTC_APP_ID", "demo-app"),
        var("RTC_CHANNEL", "demo"),
        std::env::var("RTC_TOKEN").ok(),
        var("RTC_USER_ID", "local"),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    info!("RTC demo starting");

    let config = load_config()?;
    let params = join_params();
    let channel = params.channel.clone();

    let provider = LoopbackProvider::new();
    for surface in [LOCAL_SURFACE, REMOTE_SURFACE] {
        provider.register_surface(surface);
    }

    let (command_tx, command_rx) = command_channel();
    let (event_tx, event_rx) = event_channel();
    let driver = create_driver(Arc::new(provider.clone()), config, command_rx, event_tx);
    let engine = tokio::spawn(driver.run());
    let host = Host::new(command_tx, event_rx);

    host.init().await?;
    host.play_local(LOCAL_SURFACE).await?;
    host.join(params).await?;
    host.wait_for(STEP_TIMEOUT, |e| matches!(e, SessionEvent::Published))
        .await
        .context("Local tracks were not published")?;

    // A second session in the same channel, standing in for another user.
    let (peer_tx, _peer_rx) = event_channel();
    let peer = Session::new(Arc::new(provider.clone()), SessionConfig::default(), peer_tx);
    peer.init().await?;
    peer.join(JoinParams::new("demo-app", channel.as_str(), None, PEER_ID))
        .await?;

    host.wait_for(STEP_TIMEOUT, |e| {
        matches!(
            e,
            SessionEvent::RemoteTrackSubscribed { participant_id, kind: MediaKind::Video, .. }
                if participant_id == PEER_ID
        )
    })
    .await
    .context("Remote video was not subscribed")?;

    let status = host.status(STEP_TIMEOUT).await?;
    info!(?status, "Session status");
    if !status.remote_publish_observed {
        bail!("Remote video is not being rendered");
    }

    peer.leave().await?;
    host.wait_for(STEP_TIMEOUT, |e| matches!(e, SessionEvent::ParticipantLeft { .. }))
        .await?;

    host.leave().await?;
    host.shutdown().await?;
    host.wait_for(STEP_TIMEOUT, |e| matches!(e, SessionEvent::Shutdown))
        .await?;
    engine.await.context("Session driver panicked")?;

    info!(members = provider.members(&channel).len(), "RTC demo finished");
    Ok(())
}
