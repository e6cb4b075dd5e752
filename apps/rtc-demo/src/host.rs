//! Host side of the command/event channels.

use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::{Receiver, TryRecvError};
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, instrument, warn};

use rtc_ipc::{JoinParams, SessionCommand, SessionEvent, SessionStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What a UI shell would hold: a way to send commands and a queue of events.
pub struct Host {
    command_tx: Sender<SessionCommand>,
    event_rx: Receiver<SessionEvent>,
}

impl Host {
    pub fn new(command_tx: Sender<SessionCommand>, event_rx: Receiver<SessionEvent>) -> Self {
        Self {
            command_tx,
            event_rx,
        }
    }

    #[instrument(skip(self))]
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        debug!("Sending command");
        self.command_tx
            .send(command)
            .await
            .map_err(|e| anyhow!("Failed to send command: {}", e))
    }

    pub async fn init(&self) -> Result<()> {
        self.send(SessionCommand::Init).await
    }

    pub async fn join(&self, params: JoinParams) -> Result<()> {
        self.send(SessionCommand::Join(params)).await
    }

    pub async fn play_local(&self, surface_id: &str) -> Result<()> {
        self.send(SessionCommand::PlayLocal {
            surface_id: surface_id.to_string(),
        })
        .await
    }

    pub async fn leave(&self) -> Result<()> {
        self.send(SessionCommand::Leave).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(SessionCommand::Shutdown).await
    }

    /// Request and wait for a status snapshot.
    pub async fn status(&self, timeout: Duration) -> Result<SessionStatus> {
        self.send(SessionCommand::GetStatus).await?;
        match self
            .wait_for(timeout, |e| matches!(e, SessionEvent::Status(_)))
            .await?
        {
            SessionEvent::Status(status) => Ok(status),
            other => Err(anyhow!("Unexpected event: {:?}", other)),
        }
    }

    /// Drain pending events.
    pub fn poll_events(&self) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        loop {
            match self.event_rx.try_recv() {
                Ok(event) => events.push(event),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    warn!("Event channel disconnected");
                    break;
                }
            }
        }
        events
    }

    /// Log events until one matches `pred`, or fail after `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        pred: impl Fn(&SessionEvent) -> bool,
    ) -> Result<SessionEvent> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for event in self.poll_events() {
                log_event(&event);
                if pred(&event) {
                    return Ok(event);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(anyhow!("Timed out after {:?}", timeout));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::Error {
            recoverable,
            message,
        } => warn!(recoverable, "Session error: {}", message),
        SessionEvent::StateChanged { previous, current } => {
            info!(previous = previous.name(), current = current.name(), "State changed")
        }
        other => info!(event = ?other, "Session event"),
    }
}
