//! Cheap-to-clone interface to a session worker.

use kasa_core::{DeviceKey, SessionState, SessionView};
use kasa_protocol::DeviceOp;
use tokio::sync::{mpsc, oneshot, watch};

use super::{SessionError, WorkerCommand};

/// Handle for sending commands to one session worker and observing its state.
#[derive(Clone)]
pub struct WorkerHandle {
    id: u64,
    key: DeviceKey,
    sender: mpsc::Sender<WorkerCommand>,
    state: watch::Receiver<SessionView>,
    connect_attempts: u32,
}

impl WorkerHandle {
    pub(crate) fn new(
        id: u64,
        key: DeviceKey,
        sender: mpsc::Sender<WorkerCommand>,
        state: watch::Receiver<SessionView>,
        connect_attempts: u32,
    ) -> Self {
        Self {
            id,
            key,
            sender,
            state,
            connect_attempts,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn key(&self) -> &DeviceKey {
        &self.key
    }

    /// Returns a snapshot of the session.
    pub fn view(&self) -> SessionView {
        self.state.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().state
    }

    /// Runs a device operation, queued behind any earlier command.
    ///
    /// # Errors
    ///
    /// - `SessionError::NotConnected` if the worker has terminated
    /// - any error the worker reports for the operation
    pub async fn execute(&self, op: DeviceOp) -> Result<String, SessionError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(WorkerCommand::Execute { op, respond_to: tx })
            .await
            .map_err(|_| self.gone())?;

        rx.await.map_err(|_| self.gone())?
    }

    /// Closes the device and terminates the worker.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(WorkerCommand::Disconnect { respond_to: tx })
            .await
            .map_err(|_| self.gone())?;

        rx.await.map_err(|_| self.gone())?
    }

    /// Waits until the handshake has completed.
    ///
    /// Returns immediately if the session is already established.
    ///
    /// # Errors
    ///
    /// `SessionError::ConnectFailed` if the worker terminated instead.
    pub async fn wait_connected(&self) -> Result<(), SessionError> {
        let mut state = self.state.clone();
        loop {
            let current = state.borrow_and_update().state;
            if current.is_established() {
                return Ok(());
            }
            if current.is_terminal() {
                return Err(self.connect_failed());
            }
            if state.changed().await.is_err() {
                // Worker gone; its last published state decides
                return if state.borrow().state.is_established() {
                    Ok(())
                } else {
                    Err(self.connect_failed())
                };
            }
        }
    }

    /// Waits until the worker has reached its terminal state.
    pub async fn wait_terminated(&self) {
        let mut state = self.state.clone();
        while !state.borrow_and_update().state.is_terminal() {
            if state.changed().await.is_err() {
                return;
            }
        }
    }

    fn gone(&self) -> SessionError {
        SessionError::NotConnected(self.key.clone())
    }

    fn connect_failed(&self) -> SessionError {
        SessionError::ConnectFailed {
            key: self.key.clone(),
            attempts: self.connect_attempts,
        }
    }
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .finish()
    }
}
