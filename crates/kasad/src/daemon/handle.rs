//! Handle for interacting with the session manager.

use kasa_core::{DeviceKey, ErrorCode, Failure, SessionView};
use tokio::sync::{broadcast, mpsc, oneshot};

use super::{DaemonError, ManagerCommand};
use crate::worker::SessionEvent;

/// Cheap-to-clone handle for the session manager.
#[derive(Clone)]
pub struct ManagerHandle {
    sender: mpsc::Sender<ManagerCommand>,
    events: broadcast::Sender<SessionEvent>,
}

impl ManagerHandle {
    pub(crate) fn new(
        sender: mpsc::Sender<ManagerCommand>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self { sender, events }
    }

    /// Runs one command text and returns its reply payload.
    ///
    /// Never fails with a transport error: a stopped manager is reported
    /// as a `daemon_unavailable` failure like any other outcome.
    pub async fn execute(&self, command: impl Into<String>) -> Result<String, Failure> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Execute {
                command: command.into(),
                respond_to: tx,
            })
            .await
            .map_err(|_| stopped())?;

        rx.await.map_err(|_| stopped())?
    }

    pub async fn sessions(&self) -> Result<Vec<SessionView>, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Sessions { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ManagerClosed)?;
        rx.await.map_err(|_| DaemonError::ManagerClosed)
    }

    pub async fn keys(&self) -> Result<Vec<DeviceKey>, DaemonError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ManagerCommand::Keys { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ManagerClosed)?;
        rx.await.map_err(|_| DaemonError::ManagerClosed)
    }

    /// Subscribes to session lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

fn stopped() -> Failure {
    Failure::new(ErrorCode::DaemonUnavailable, "session manager is not running")
}
