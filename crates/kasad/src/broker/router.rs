//! Router actor - owns the identity table and every in-flight request.
//!
//! Connection handlers never touch routing state directly; they send
//! [`RouterCommand`]s and await oneshot replies, so registration, forwarding
//! and reply correlation are serialized on one task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Reply send failures (client gone, request abandoned) are ignored

use std::collections::HashMap;

use kasa_core::{ClientAddress, ErrorCode, Failure, Identity, RequestId};
use kasa_protocol::{split_target, BrokerToDaemon};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::BrokerError;

/// Outcome of a routed request as seen by the client connection.
pub type Outcome = Result<String, Failure>;

/// Channel buffer size for router commands
const COMMAND_BUFFER: usize = 256;

// ============================================================================
// Commands
// ============================================================================

/// Commands sent to the router actor.
#[derive(Debug)]
pub enum RouterCommand {
    /// Route a client payload to the daemon named by its first token.
    Request {
        client: ClientAddress,
        payload: String,
        respond_to: oneshot::Sender<Outcome>,
    },

    /// The client gave up waiting; drop its pending request.
    Abandon { client: ClientAddress },

    /// Claim an identity for a daemon connection.
    RegisterDaemon {
        identity: Identity,
        connection: u64,
        outbox: mpsc::Sender<BrokerToDaemon>,
        respond_to: oneshot::Sender<Result<(), BrokerError>>,
    },

    /// A daemon connection closed.
    DaemonLeft { identity: Identity, connection: u64 },

    /// A daemon answered a forwarded request.
    DaemonReply {
        identity: Identity,
        client: ClientAddress,
        request_id: RequestId,
        outcome: Outcome,
    },

    /// List registered identities.
    Identities {
        respond_to: oneshot::Sender<Vec<Identity>>,
    },
}

// ============================================================================
// Actor
// ============================================================================

struct DaemonEntry {
    connection: u64,
    outbox: mpsc::Sender<BrokerToDaemon>,
}

struct Pending {
    client: ClientAddress,
    identity: Identity,
    respond_to: oneshot::Sender<Outcome>,
}

/// The router actor - owns all routing state.
pub struct RouterActor {
    receiver: mpsc::Receiver<RouterCommand>,
    daemons: HashMap<Identity, DaemonEntry>,
    pending: HashMap<RequestId, Pending>,
    next_request_id: u64,
    cancel: CancellationToken,
}

impl RouterActor {
    pub fn new(receiver: mpsc::Receiver<RouterCommand>, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            daemons: HashMap::new(),
            pending: HashMap::new(),
            next_request_id: 0,
            cancel,
        }
    }

    /// Processes commands until cancelled or every handle is dropped.
    pub async fn run(mut self) {
        info!("Router starting");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => break,
                },
            }
        }

        // Waiting clients get an answer rather than a dropped channel
        for (_, pending) in self.pending.drain() {
            let _ = pending.respond_to.send(Err(Failure::new(
                ErrorCode::DaemonUnavailable,
                "broker shutting down",
            )));
        }

        info!(daemons = self.daemons.len(), "Router stopped");
    }

    fn handle_command(&mut self, cmd: RouterCommand) {
        match cmd {
            RouterCommand::Request {
                client,
                payload,
                respond_to,
            } => self.handle_request(client, payload, respond_to),
            RouterCommand::Abandon { client } => self.handle_abandon(&client),
            RouterCommand::RegisterDaemon {
                identity,
                connection,
                outbox,
                respond_to,
            } => {
                let result = self.handle_register(identity, connection, outbox);
                let _ = respond_to.send(result);
            }
            RouterCommand::DaemonLeft {
                identity,
                connection,
            } => self.handle_daemon_left(&identity, connection),
            RouterCommand::DaemonReply {
                identity,
                client,
                request_id,
                outcome,
            } => self.handle_reply(&identity, &client, request_id, outcome),
            RouterCommand::Identities { respond_to } => {
                let mut identities: Vec<_> = self.daemons.keys().cloned().collect();
                identities.sort();
                let _ = respond_to.send(identities);
            }
        }
    }

    fn handle_request(
        &mut self,
        client: ClientAddress,
        payload: String,
        respond_to: oneshot::Sender<Outcome>,
    ) {
        let routed = match split_target(&payload) {
            Ok(routed) => routed,
            Err(err) => {
                debug!(client = %client, error = %err, "Rejecting malformed request");
                let _ = respond_to.send(Err(Failure::invalid_request(err.to_string())));
                return;
            }
        };

        let Some(daemon) = self.daemons.get(&routed.target) else {
            debug!(client = %client, target = %routed.target, "No daemon for identity");
            let _ = respond_to.send(Err(Failure::unknown_identity(&routed.target)));
            return;
        };

        self.next_request_id += 1;
        let request_id = RequestId(self.next_request_id);

        let frame = BrokerToDaemon::Forward {
            client: client.clone(),
            request_id,
            payload: routed.command,
        };

        // Never block the router on a slow daemon
        if let Err(err) = daemon.outbox.try_send(frame) {
            warn!(target = %routed.target, error = %err, "Daemon outbox unavailable");
            let _ = respond_to.send(Err(Failure::new(
                ErrorCode::DaemonUnavailable,
                format!("daemon {} is not accepting requests", routed.target),
            )));
            return;
        }

        debug!(client = %client, target = %routed.target, request_id = %request_id, "Forwarded request");
        self.pending.insert(
            request_id,
            Pending {
                client,
                identity: routed.target,
                respond_to,
            },
        );
    }

    fn handle_abandon(&mut self, client: &ClientAddress) {
        let before = self.pending.len();
        self.pending.retain(|_, p| &p.client != client);
        let dropped = before - self.pending.len();
        if dropped > 0 {
            debug!(client = %client, dropped, "Abandoned pending requests");
        }
    }

    fn handle_register(
        &mut self,
        identity: Identity,
        connection: u64,
        outbox: mpsc::Sender<BrokerToDaemon>,
    ) -> Result<(), BrokerError> {
        if !identity.is_valid() {
            return Err(BrokerError::InvalidIdentity(identity));
        }

        if let Some(existing) = self.daemons.get(&identity) {
            // A dead connection whose outbox is closed can be replaced
            if !existing.outbox.is_closed() {
                warn!(identity = %identity, "Identity already registered");
                return Err(BrokerError::IdentityTaken(identity));
            }
            self.fail_pending_for(&identity);
        }

        info!(identity = %identity, connection, "Daemon registered");
        self.daemons
            .insert(identity, DaemonEntry { connection, outbox });
        Ok(())
    }

    fn handle_daemon_left(&mut self, identity: &Identity, connection: u64) {
        // A rejected duplicate must not unregister the live daemon
        if self
            .daemons
            .get(identity)
            .is_some_and(|entry| entry.connection == connection)
        {
            self.daemons.remove(identity);
            self.fail_pending_for(identity);
            info!(identity = %identity, "Daemon unregistered");
        }
    }

    fn fail_pending_for(&mut self, identity: &Identity) {
        let ids: Vec<RequestId> = self
            .pending
            .iter()
            .filter(|(_, p)| &p.identity == identity)
            .map(|(id, _)| *id)
            .collect();

        for id in ids {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.respond_to.send(Err(Failure::new(
                    ErrorCode::DaemonUnavailable,
                    format!("daemon {identity} disconnected"),
                )));
            }
        }
    }

    fn handle_reply(
        &mut self,
        identity: &Identity,
        client: &ClientAddress,
        request_id: RequestId,
        outcome: Outcome,
    ) {
        let matches = self
            .pending
            .get(&request_id)
            .is_some_and(|p| &p.client == client && &p.identity == identity);

        if !matches {
            debug!(identity = %identity, request_id = %request_id, "Discarding stale reply");
            return;
        }

        if let Some(pending) = self.pending.remove(&request_id) {
            let _ = pending.respond_to.send(outcome);
        }
    }
}

// ============================================================================
// Handle
// ============================================================================

/// Cheap-to-clone handle to the router actor.
#[derive(Clone)]
pub struct RouterHandle {
    sender: mpsc::Sender<RouterCommand>,
}

impl RouterHandle {
    /// Routes a client payload and returns a receiver for its outcome.
    ///
    /// Sending is separate from waiting so the caller can bound the wait.
    pub async fn request(
        &self,
        client: ClientAddress,
        payload: String,
    ) -> Result<oneshot::Receiver<Outcome>, BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RouterCommand::Request {
                client,
                payload,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RouterClosed)?;
        Ok(rx)
    }

    pub async fn abandon(&self, client: ClientAddress) {
        let _ = self.sender.send(RouterCommand::Abandon { client }).await;
    }

    pub async fn register_daemon(
        &self,
        identity: Identity,
        connection: u64,
        outbox: mpsc::Sender<BrokerToDaemon>,
    ) -> Result<(), BrokerError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RouterCommand::RegisterDaemon {
                identity,
                connection,
                outbox,
                respond_to: tx,
            })
            .await
            .map_err(|_| BrokerError::RouterClosed)?;
        rx.await.map_err(|_| BrokerError::RouterClosed)?
    }

    pub async fn daemon_left(&self, identity: Identity, connection: u64) {
        let _ = self
            .sender
            .send(RouterCommand::DaemonLeft {
                identity,
                connection,
            })
            .await;
    }

    pub async fn daemon_reply(
        &self,
        identity: Identity,
        client: ClientAddress,
        request_id: RequestId,
        outcome: Outcome,
    ) {
        let _ = self
            .sender
            .send(RouterCommand::DaemonReply {
                identity,
                client,
                request_id,
                outcome,
            })
            .await;
    }

    /// Returns registered identities, or an empty list if the router stopped.
    pub async fn identities(&self) -> Vec<Identity> {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(RouterCommand::Identities { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }
}

/// Spawns the router actor and returns its handle.
pub fn spawn_router(cancel: CancellationToken) -> RouterHandle {
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(RouterActor::new(rx, cancel).run());
    RouterHandle { sender: tx }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn daemon(
        router: &RouterHandle,
        name: &str,
        connection: u64,
    ) -> mpsc::Receiver<BrokerToDaemon> {
        let (tx, rx) = mpsc::channel(8);
        router
            .register_daemon(Identity::new(name), connection, tx)
            .await
            .unwrap();
        rx
    }

    #[tokio::test]
    async fn test_request_forwarded_and_reply_routed() {
        let router = spawn_router(CancellationToken::new());
        let mut gatt = daemon(&router, "GATT", 1).await;

        let client = ClientAddress::new("client-0");
        let reply = router
            .request(client.clone(), "GATT read AA 0x25".to_string())
            .await
            .unwrap();

        let Some(BrokerToDaemon::Forward {
            client: to,
            request_id,
            payload,
        }) = gatt.recv().await
        else {
            panic!("expected a forward frame");
        };
        assert_eq!(to, client);
        assert_eq!(payload, "read AA 0x25");

        router
            .daemon_reply(Identity::new("GATT"), to, request_id, Ok("2a".to_string()))
            .await;
        assert_eq!(reply.await.unwrap(), Ok("2a".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_identity_and_empty_payload() {
        let router = spawn_router(CancellationToken::new());
        let client = ClientAddress::new("client-0");

        let outcome = router
            .request(client.clone(), "Hue on lamp".to_string())
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.unwrap_err().code, ErrorCode::UnknownIdentity);

        let outcome = router
            .request(client, "   ".to_string())
            .await
            .unwrap()
            .await
            .unwrap();
        assert_eq!(outcome.unwrap_err().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_duplicate_identity_rejected() {
        let router = spawn_router(CancellationToken::new());
        let _first = daemon(&router, "WeMo", 1).await;

        let (tx, _rx) = mpsc::channel(8);
        let err = router
            .register_daemon(Identity::new("WeMo"), 2, tx)
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::IdentityTaken(_)));

        // The rejected connection leaving does not unregister the first
        router.daemon_left(Identity::new("WeMo"), 2).await;
        assert_eq!(router.identities().await, vec![Identity::new("WeMo")]);
    }

    #[tokio::test]
    async fn test_daemon_leaving_fails_pending_requests() {
        let router = spawn_router(CancellationToken::new());
        let _gatt = daemon(&router, "GATT", 1).await;

        let reply = router
            .request(ClientAddress::new("client-0"), "GATT active".to_string())
            .await
            .unwrap();
        router.daemon_left(Identity::new("GATT"), 1).await;

        let failure = reply.await.unwrap().unwrap_err();
        assert_eq!(failure.code, ErrorCode::DaemonUnavailable);
        assert!(router.identities().await.is_empty());
    }

    #[tokio::test]
    async fn test_abandoned_request_discards_late_reply() {
        let router = spawn_router(CancellationToken::new());
        let mut gatt = daemon(&router, "GATT", 1).await;
        let client = ClientAddress::new("client-0");

        let reply = router
            .request(client.clone(), "GATT active".to_string())
            .await
            .unwrap();
        let Some(BrokerToDaemon::Forward { request_id, .. }) = gatt.recv().await else {
            panic!("expected a forward frame");
        };

        router.abandon(client.clone()).await;
        router
            .daemon_reply(Identity::new("GATT"), client, request_id, Ok("late".to_string()))
            .await;

        // The pending entry is gone, so the reply channel was dropped unanswered
        assert!(reply.await.is_err());
    }
}
