//! Session manager actor - owns the device key → worker map.
//!
//! The manager decodes each command text in arrival order and mutates its
//! map on its own task. Anything that waits on a device (handshakes,
//! device operations, disconnects, discovery) runs in a spawned task that
//! answers the command's oneshot, so keys proceed in parallel while each
//! key stays serialized by its worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use kasa_core::{DeviceKey, ErrorCode, Failure, SessionConfig};
use kasa_protocol::{DaemonCommand, DeviceOp};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ManagerCommand;
use crate::link::{Discovery, LinkFactory};
use crate::worker::{spawn_worker, Eviction, EvictionReason, SessionEvent, Supervisor, WorkerHandle};

type Reply = oneshot::Sender<Result<String, Failure>>;

/// Slack added to the discovery window before the scan counts as hung
const DISCOVERY_GRACE: Duration = Duration::from_secs(1);

/// Collaborators and options for a session manager.
#[derive(Clone)]
pub struct ManagerOptions {
    pub links: Arc<dyn LinkFactory>,
    pub discovery: Arc<dyn Discovery>,
    pub session: SessionConfig,
    /// Spawn a worker on first device command instead of answering `unknown_device`
    pub auto_connect: bool,
    pub discovery_window: Duration,
}

/// The session manager actor.
pub struct SessionManager {
    receiver: mpsc::Receiver<ManagerCommand>,
    evictions: mpsc::UnboundedReceiver<Eviction>,
    workers: HashMap<DeviceKey, WorkerHandle>,
    next_worker_id: u64,
    options: ManagerOptions,
    supervisor: Supervisor,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Creates a manager with an empty worker map.
    pub fn new(
        receiver: mpsc::Receiver<ManagerCommand>,
        events: broadcast::Sender<SessionEvent>,
        options: ManagerOptions,
        cancel: CancellationToken,
    ) -> Self {
        let (evict_tx, evict_rx) = mpsc::unbounded_channel();
        let supervisor = Supervisor {
            events,
            evictions: evict_tx,
            cancel: cancel.child_token(),
        };

        Self {
            receiver,
            evictions: evict_rx,
            workers: HashMap::new(),
            next_worker_id: 0,
            options,
            supervisor,
            cancel,
        }
    }

    /// Runs until cancelled or every handle is dropped.
    ///
    /// Workers share a child of the manager's token and stop with it.
    pub async fn run(mut self) {
        info!(auto_connect = self.options.auto_connect, "Session manager starting");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(eviction) = self.evictions.recv() => self.handle_eviction(eviction),

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        self.supervisor.cancel.cancel();
        info!(sessions = self.workers.len(), "Session manager stopped");
    }

    fn handle_command(&mut self, cmd: ManagerCommand) {
        match cmd {
            ManagerCommand::Execute {
                command,
                respond_to,
            } => self.handle_execute(&command, respond_to),
            ManagerCommand::Sessions { respond_to } => {
                let mut views: Vec<_> = self.workers.values().map(WorkerHandle::view).collect();
                views.sort_by(|a, b| a.key.cmp(&b.key));
                let _ = respond_to.send(views);
            }
            ManagerCommand::Keys { respond_to } => {
                let _ = respond_to.send(self.sorted_keys());
            }
        }
    }

    fn handle_execute(&mut self, text: &str, respond_to: Reply) {
        let command = match DaemonCommand::parse(text) {
            Ok(command) => command,
            Err(err) => {
                let failure = match DaemonCommand::device_target(text) {
                    Some(key) if !self.options.auto_connect && self.live_worker(&key).is_none() => {
                        Failure::unknown_device(&key)
                    }
                    _ => Failure::invalid_request(err.to_string()),
                };
                debug!(command = text, code = %failure.code, "Rejecting command");
                let _ = respond_to.send(Err(failure));
                return;
            }
        };

        match command {
            DaemonCommand::Active => {
                let keys: Vec<String> = self.sorted_keys().iter().map(ToString::to_string).collect();
                let _ = respond_to.send(Ok(keys.join(",")));
            }
            DaemonCommand::Sessions => {
                let mut views: Vec<_> = self.workers.values().map(WorkerHandle::view).collect();
                views.sort_by(|a, b| a.key.cmp(&b.key));
                let summary: Vec<String> = views.iter().map(|v| v.summary()).collect();
                let _ = respond_to.send(Ok(summary.join(",")));
            }
            DaemonCommand::Discover => self.discover(respond_to),
            DaemonCommand::Connect(key) => self.connect(key, respond_to),
            DaemonCommand::Disconnect(key) => self.disconnect(&key, respond_to),
            DaemonCommand::Device { key, op } => self.device(key, op, respond_to),
        }
    }

    fn connect(&mut self, key: DeviceKey, respond_to: Reply) {
        let worker = match self.live_worker(&key) {
            Some(worker) => {
                debug!(key = %key, "Reusing existing session");
                worker
            }
            None => self.spawn(key),
        };

        tokio::spawn(async move {
            let outcome = worker
                .wait_connected()
                .await
                .map(|()| "ok".to_string())
                .map_err(Failure::from);
            let _ = respond_to.send(outcome);
        });
    }

    fn disconnect(&mut self, key: &DeviceKey, respond_to: Reply) {
        let Some(worker) = self.workers.remove(key) else {
            let _ = respond_to.send(Err(Failure::unknown_device(key)));
            return;
        };

        info!(key = %key, "Disconnecting session");
        let _ = self.supervisor.events.send(SessionEvent::Evicted {
            key: key.clone(),
            reason: EvictionReason::Disconnected,
        });

        tokio::spawn(async move {
            let outcome = worker
                .disconnect()
                .await
                .map(|()| "ok".to_string())
                .map_err(Failure::from);
            let _ = respond_to.send(outcome);
        });
    }

    fn device(&mut self, key: DeviceKey, op: DeviceOp, respond_to: Reply) {
        let worker = match self.live_worker(&key) {
            Some(worker) => worker,
            None if self.options.auto_connect => self.spawn(key),
            None => {
                let _ = respond_to.send(Err(Failure::unknown_device(&key)));
                return;
            }
        };

        tokio::spawn(async move {
            let outcome = worker.execute(op).await.map_err(Failure::from);
            let _ = respond_to.send(outcome);
        });
    }

    fn discover(&self, respond_to: Reply) {
        let discovery = Arc::clone(&self.options.discovery);
        let window = self.options.discovery_window;

        tokio::spawn(async move {
            let outcome = match timeout(window + DISCOVERY_GRACE, discovery.discover(window)).await {
                Ok(Ok(keys)) => Ok(keys
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(",")),
                Ok(Err(err)) => Err(Failure::from(err)),
                Err(_) => Err(Failure::new(
                    ErrorCode::Timeout,
                    format!("discovery did not finish within {window:?}"),
                )),
            };
            let _ = respond_to.send(outcome);
        });
    }

    /// Returns the worker for `key` unless it is already terminal.
    ///
    /// A terminal worker whose eviction is still in flight is dropped here,
    /// so every command sees the key as if the eviction had already landed.
    fn live_worker(&mut self, key: &DeviceKey) -> Option<WorkerHandle> {
        let worker = self.workers.get(key)?;
        if worker.state().is_terminal() {
            self.workers.remove(key);
            return None;
        }
        Some(worker.clone())
    }

    fn spawn(&mut self, key: DeviceKey) -> WorkerHandle {
        self.next_worker_id += 1;
        let link = self.options.links.create(&key);
        let worker = spawn_worker(
            self.next_worker_id,
            key.clone(),
            link,
            self.options.session.clone(),
            self.supervisor.clone(),
        );

        info!(key = %key, worker = self.next_worker_id, "Spawned session worker");
        let _ = self
            .supervisor
            .events
            .send(SessionEvent::Spawned { key: key.clone() });
        self.workers.insert(key, worker.clone());
        worker
    }

    fn handle_eviction(&mut self, eviction: Eviction) {
        // A replacement worker may already own the key
        let current = self
            .workers
            .get(&eviction.key)
            .is_some_and(|w| w.id() == eviction.worker_id);

        if !current {
            debug!(key = %eviction.key, worker = eviction.worker_id, "Ignoring stale eviction");
            return;
        }

        self.workers.remove(&eviction.key);
        warn!(key = %eviction.key, reason = %eviction.reason, "Evicted session");
        let _ = self.supervisor.events.send(SessionEvent::Evicted {
            key: eviction.key,
            reason: eviction.reason,
        });
    }

    fn sorted_keys(&self) -> Vec<DeviceKey> {
        let mut keys: Vec<_> = self.workers.keys().cloned().collect();
        keys.sort();
        keys
    }
}
