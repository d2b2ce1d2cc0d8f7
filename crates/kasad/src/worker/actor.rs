//! Session worker - exclusive owner of one device link.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Every device call is bounded by a deadline
//! - Reply send failures (caller gave up) are ignored

use std::time::Duration;

use chrono::Utc;
use kasa_core::{DeviceKey, SessionConfig, SessionState, SessionView};
use kasa_protocol::DeviceOp;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    Eviction, EvictionReason, SessionError, SessionEvent, Supervisor, WorkerCommand,
};
use crate::link::{DeviceLink, LinkError};

/// How the command loop ended.
enum Exit {
    /// Explicit disconnect; the link is already closed
    Closed,
    /// Connectivity lost for good
    Lost(EvictionReason),
    /// Shutdown or every handle dropped
    Shutdown,
}

/// The worker task state.
pub struct SessionWorker {
    id: u64,
    key: DeviceKey,
    link: Box<dyn DeviceLink>,
    config: SessionConfig,
    receiver: mpsc::Receiver<WorkerCommand>,
    state: watch::Sender<SessionView>,
    supervisor: Supervisor,
}

impl SessionWorker {
    /// Creates a worker; nothing runs until [`SessionWorker::run`].
    ///
    /// # Arguments
    ///
    /// * `id` - Incarnation number, echoed in the worker's eviction
    /// * `key` - Device this worker owns
    /// * `link` - Unconnected link to the device
    /// * `config` - Retry, idle and deadline bounds
    /// * `receiver` - Private command channel
    /// * `state` - Publishes the session view to every handle
    /// * `supervisor` - Event, eviction and shutdown channels shared with the manager
    pub fn new(
        id: u64,
        key: DeviceKey,
        link: Box<dyn DeviceLink>,
        config: SessionConfig,
        receiver: mpsc::Receiver<WorkerCommand>,
        state: watch::Sender<SessionView>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            id,
            key,
            link,
            config,
            receiver,
            state,
            supervisor,
        }
    }

    /// Runs the worker until it terminates.
    pub async fn run(mut self) {
        info!(key = %self.key, worker = self.id, "Session worker starting");
        let cancel = self.supervisor.cancel.clone();

        let handshake = tokio::select! {
            _ = cancel.cancelled() => {
                self.terminate(None);
                return;
            }
            result = self.handshake() => result,
        };

        if let Err(err) = handshake {
            warn!(key = %self.key, error = %err, "Handshake failed");
            self.fail_queued(&err);
            self.terminate(Some(EvictionReason::ConnectFailed));
            return;
        }

        self.transition(SessionState::Connected);
        self.transition(SessionState::Idle);

        match self.serve(&cancel).await {
            Exit::Closed => self.terminate(None),
            Exit::Lost(reason) => {
                self.fail_queued(&SessionError::NotConnected(self.key.clone()));
                self.terminate(Some(reason));
            }
            Exit::Shutdown => {
                self.close_link().await.ok();
                self.terminate(None);
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), SessionError> {
        let attempts = self.config.connect_retries.max(1);

        for attempt in 1..=attempts {
            match timeout(self.config.connect_timeout(), self.link.connect(&self.key)).await {
                Ok(Ok(())) => {
                    info!(key = %self.key, attempt, "Device connected");
                    self.touch();
                    return Ok(());
                }
                Ok(Err(err)) => {
                    warn!(key = %self.key, attempt, attempts, error = %err, "Connect attempt failed");
                }
                Err(_) => {
                    warn!(key = %self.key, attempt, attempts, "Connect attempt timed out");
                }
            }
        }

        Err(SessionError::ConnectFailed {
            key: self.key.clone(),
            attempts,
        })
    }

    async fn serve(&mut self, cancel: &tokio_util::sync::CancellationToken) -> Exit {
        let idle = self.config.idle_timeout();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Exit::Shutdown,
                next = timeout(idle, self.receiver.recv()) => next,
            };

            match next {
                // Idle long enough: check the link is still there
                Err(_) => {
                    debug!(key = %self.key, "Idle timeout, probing device");
                    if !self.ensure_live(SessionState::Idle).await {
                        return Exit::Lost(EvictionReason::ReconnectFailed);
                    }
                }

                Ok(None) => {
                    debug!(key = %self.key, "All handles dropped");
                    return Exit::Shutdown;
                }

                Ok(Some(WorkerCommand::Execute { op, respond_to })) => {
                    let settle = match self.settle_for(&op) {
                        Ok(settle) => settle,
                        Err(err) => {
                            warn!(key = %self.key, op = %op, error = %err, "Command rejected");
                            let _ = respond_to.send(Err(err));
                            continue;
                        }
                    };

                    self.transition(SessionState::Busy);

                    if !self.ensure_live(SessionState::Busy).await {
                        let _ = respond_to.send(Err(SessionError::NotConnected(self.key.clone())));
                        return Exit::Lost(EvictionReason::ReconnectFailed);
                    }

                    let result = self.execute(&op, settle).await;
                    if let Err(err) = &result {
                        warn!(key = %self.key, op = %op, error = %err, "Command failed");
                    }
                    self.touch();
                    let _ = respond_to.send(result);

                    self.transition(SessionState::Idle);
                }

                Ok(Some(WorkerCommand::Disconnect { respond_to })) => {
                    let result = self.close_link().await;
                    let _ = respond_to.send(result);
                    return Exit::Closed;
                }
            }
        }
    }

    /// Probes the link; on failure makes exactly one reconnect attempt.
    ///
    /// Returns false if the device could not be brought back.
    async fn ensure_live(&mut self, resume: SessionState) -> bool {
        match timeout(self.config.command_timeout(), self.link.probe()).await {
            Ok(Ok(())) => {
                self.touch();
                return true;
            }
            Ok(Err(err)) => warn!(key = %self.key, error = %err, "Liveness probe failed"),
            Err(_) => warn!(key = %self.key, "Liveness probe timed out"),
        }

        self.transition(SessionState::Reconnecting);
        let _ = self.supervisor.events.send(SessionEvent::Reconnecting {
            key: self.key.clone(),
        });

        match timeout(self.config.connect_timeout(), self.link.connect(&self.key)).await {
            Ok(Ok(())) => {
                self.state.send_modify(|view| view.reconnects += 1);
                info!(key = %self.key, "Device reconnected");
                self.touch();
                self.transition(resume);
                true
            }
            Ok(Err(err)) => {
                warn!(key = %self.key, error = %err, "Reconnect failed");
                false
            }
            Err(_) => {
                warn!(key = %self.key, "Reconnect timed out");
                false
            }
        }
    }

    /// Settle time `op` needs between enable and read, bounded by config.
    fn settle_for(&self, op: &DeviceOp) -> Result<Duration, SessionError> {
        let DeviceOp::ReadValue { settle, .. } = op else {
            return Ok(Duration::ZERO);
        };

        let settle = settle.unwrap_or_else(|| self.config.read_value_delay());
        let max = self.config.max_read_value_delay();
        if settle > max {
            return Err(SessionError::Rejected {
                key: self.key.clone(),
                operation: op.verb(),
                reason: format!("sleep {settle:?} exceeds the {max:?} limit"),
            });
        }
        Ok(settle)
    }

    async fn execute(&mut self, op: &DeviceOp, settle: Duration) -> Result<String, SessionError> {
        let deadline = self.config.command_timeout() + settle;

        debug!(key = %self.key, op = %op, "Executing");
        match timeout(deadline, run_op(self.link.as_mut(), op, settle)).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Timeout {
                key: self.key.clone(),
                operation: op.verb(),
                after: deadline,
            }),
        }
    }

    async fn close_link(&mut self) -> Result<(), SessionError> {
        match timeout(self.config.command_timeout(), self.link.close()).await {
            Ok(result) => result.map_err(SessionError::from),
            Err(_) => Err(SessionError::Timeout {
                key: self.key.clone(),
                operation: "disconnect",
                after: self.config.command_timeout(),
            }),
        }
    }

    /// Answers every queued command with `err` and refuses new ones.
    fn fail_queued(&mut self, err: &SessionError) {
        self.receiver.close();
        while let Ok(cmd) = self.receiver.try_recv() {
            match cmd {
                WorkerCommand::Execute { respond_to, .. } => {
                    let _ = respond_to.send(Err(err.clone()));
                }
                WorkerCommand::Disconnect { respond_to } => {
                    let _ = respond_to.send(Ok(()));
                }
            }
        }
    }

    fn terminate(&mut self, eviction: Option<EvictionReason>) {
        self.receiver.close();
        self.transition(SessionState::Disconnected);

        if let Some(reason) = eviction {
            let _ = self.supervisor.evictions.send(Eviction {
                key: self.key.clone(),
                worker_id: self.id,
                reason,
            });
        }

        info!(key = %self.key, worker = self.id, "Session worker stopped");
    }

    fn transition(&mut self, next: SessionState) {
        let current = self.state.borrow().state;
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(key = %self.key, from = %current, to = %next, "Ignoring illegal transition");
            return;
        }

        self.state.send_modify(|view| view.state = next);
        debug!(key = %self.key, from = %current, to = %next, "Session state changed");

        let _ = self.supervisor.events.send(SessionEvent::StateChanged {
            key: self.key.clone(),
            state: next,
        });
    }

    fn touch(&mut self) {
        self.state.send_modify(|view| view.last_activity = Utc::now());
    }
}

async fn run_op(
    link: &mut dyn DeviceLink,
    op: &DeviceOp,
    settle: Duration,
) -> Result<String, LinkError> {
    match op {
        DeviceOp::Read { addr } => link.read(addr).await,
        DeviceOp::Write { addr, value } => link.write(addr, value).await.map(|()| ok()),
        DeviceOp::ReadValue {
            ctrl_addr,
            read_addr,
            enable_cmd,
            disable_cmd,
            ..
        } => {
            link.write(ctrl_addr, enable_cmd).await?;
            tokio::time::sleep(settle).await;
            let value = link.read(read_addr).await;
            // Disable even when the read failed
            let disabled = link.write(ctrl_addr, disable_cmd).await;
            let value = value?;
            disabled?;
            Ok(value)
        }
        DeviceOp::On => link.set_power(true).await.map(|()| ok()),
        DeviceOp::Off => link.set_power(false).await.map(|()| ok()),
        DeviceOp::State => link
            .power()
            .await
            .map(|on| if on { "on" } else { "off" }.to_string()),
    }
}

fn ok() -> String {
    "ok".to_string()
}
