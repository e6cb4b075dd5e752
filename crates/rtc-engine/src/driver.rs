//! Command loop that exposes a session to its host over channels.

use std::future::Future;
use std::sync::Arc;

use crossbeam_channel::Sender;
use tokio::sync::mpsc::Receiver;
use tracing::{debug, info, instrument, warn};

use rtc_ipc::{JoinParams, SessionCommand, SessionConfig, SessionEvent};
use rtc_transport::TransportProvider;

use crate::error::SessionError;
use crate::session::Session;
use crate::SessionResult;

/// Drives a [`Session`] from host commands.
///
/// Results are reported as [`SessionEvent`]s. The session always leaves its
/// channel before the driver returns, whether it was told to shut down or
/// its command channel closed.
pub struct SessionDriver {
    command_rx: Receiver<SessionCommand>,
    event_tx: Sender<SessionEvent>,
    session: Session,
}

impl SessionDriver {
    /// Create a driver.
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        config: SessionConfig,
        command_rx: Receiver<SessionCommand>,
        event_tx: Sender<SessionEvent>,
    ) -> Self {
        Self {
            session: Session::new(provider, config, event_tx.clone()),
            command_rx,
            event_tx,
        }
    }

    /// The driven session, for read-only observation.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Run until `Shutdown` or until every command sender is dropped.
    #[instrument(name = "driver_run", skip(self))]
    pub async fn run(mut self) {
        info!("Session driver starting");

        loop {
            match self.command_rx.recv().await {
                Some(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                None => {
                    info!("Command channel disconnected, shutting down");
                    break;
                }
            }
        }

        if let Err(e) = self.session.leave().await {
            warn!(error = %e, "Leave on shutdown failed");
        }
        self.send_event(SessionEvent::Shutdown);
        info!("Session driver stopped");
    }

    /// Handle a command. Returns false if the driver should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        debug!(?command, "Handling command");

        let result = match command {
            SessionCommand::Init => self.start_init(),
            SessionCommand::Join(params) => self.start_join(params),
            SessionCommand::Publish => self.session.publish().await,
            SessionCommand::Leave => self.session.leave().await,
            SessionCommand::PlayLocal { surface_id } => self.session.play_local(&surface_id).await,
            SessionCommand::BindRemoteSurface {
                participant_id,
                surface_id,
            } => {
                self.session.bind_remote_surface(&participant_id, &surface_id);
                Ok(())
            }
            SessionCommand::GetDevices => self.session.get_devices().await.map(|_| ()),
            SessionCommand::GetStatus => {
                self.send_event(SessionEvent::Status(self.session.status()));
                Ok(())
            }
            SessionCommand::Shutdown => return false,
        };

        if let Err(e) = result {
            report(&self.event_tx, &e);
        }
        true
    }

    /// Create the client now and acquire tracks in a separate task, so
    /// `Join` and `Leave` are not queued behind the device prompt.
    fn start_init(&self) -> SessionResult<()> {
        let pending = self.session.start_init()?;
        self.spawn_pending(pending);
        Ok(())
    }

    /// Enter `Joining` now and await the transport in a separate task, so a
    /// following `Leave` is not queued behind the round-trip.
    fn start_join(&self, params: JoinParams) -> SessionResult<()> {
        let pending = self.session.start_join(params)?;
        self.spawn_pending(pending);
        Ok(())
    }

    /// Run the rest of an operation in the background, reporting failures
    /// other than cancellation by leave.
    fn spawn_pending(&self, pending: impl Future<Output = SessionResult<()>> + Send + 'static) {
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            match pending.await {
                Ok(()) | Err(SessionError::Cancelled) => {}
                Err(e) => report(&event_tx, &e),
            }
        });
    }

    fn send_event(&self, event: SessionEvent) {
        if let Err(e) = self.event_tx.try_send(event) {
            warn!("Failed to send event: {}", e);
        }
    }
}

fn report(event_tx: &Sender<SessionEvent>, error: &SessionError) {
    warn!(error = %error, "Command failed");
    let event = SessionEvent::Error {
        recoverable: error.is_recoverable(),
        message: error.to_string(),
    };
    if let Err(e) = event_tx.try_send(event) {
        warn!("Failed to send event: {}", e);
    }
}
