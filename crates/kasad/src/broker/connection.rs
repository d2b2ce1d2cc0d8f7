//! Per-connection handlers for the broker's two endpoints.
//!
//! A client connection handles one request at a time: the handler sends
//! it to the router and awaits the outcome before reading the next frame,
//! so replies reach a client in the order its requests were sent.
//!
//! A daemon connection splits into a reader loop (replies from the daemon)
//! and a writer task draining the router's outbox (forwarded requests).
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Connection errors are logged and result in graceful disconnect

use std::time::Duration;

use kasa_core::{ClientAddress, ErrorCode, Failure, Identity};
use kasa_protocol::{
    BrokerToClient, BrokerToDaemon, ClientMessage, ClientMessageType, DaemonMessage,
    DaemonMessageType,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::router::RouterHandle;
use crate::frame::{check_version, ConnectionError, FrameReader, FrameWriter};

/// Deadline for the opening frame of any connection
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Forwarded requests buffered per daemon before the router sees it as unavailable
const DAEMON_OUTBOX: usize = 256;

// ============================================================================
// Client connections
// ============================================================================

/// Handler for one client connection.
pub struct ClientConnection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    router: RouterHandle,
    address: ClientAddress,
    request_timeout: Duration,
    cancel: CancellationToken,
}

impl<R, W> ClientConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Creates a handler for one client connection.
    ///
    /// # Arguments
    ///
    /// * `reader` - Read half of the client stream
    /// * `writer` - Write half of the client stream
    /// * `router` - Handle to the broker's router
    /// * `address` - Routing token assigned to this client
    /// * `request_timeout` - How long to wait for a daemon reply
    /// * `max_message_size` - Frame size limit
    /// * `cancel` - Broker shutdown token
    pub fn new(
        reader: R,
        writer: W,
        router: RouterHandle,
        address: ClientAddress,
        request_timeout: Duration,
        max_message_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader, max_message_size),
            writer: FrameWriter::new(writer),
            router,
            address,
            request_timeout,
            cancel,
        }
    }

    /// Runs handshake and request loop until the client leaves.
    pub async fn run(mut self) {
        debug!(client = %self.address, "New client connected");

        if let Err(e) = self.handshake().await {
            warn!(client = %self.address, error = %e, "Client handshake failed");
            return;
        }

        match self.process_messages().await {
            Ok(()) | Err(ConnectionError::Eof) => {
                debug!(client = %self.address, "Client disconnected");
            }
            Err(e) => {
                warn!(client = %self.address, error = %e, "Client connection error");
            }
        }
    }

    async fn handshake(&mut self) -> Result<(), ConnectionError> {
        let msg: ClientMessage = timeout(HANDSHAKE_TIMEOUT, self.reader.next())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        if let Err(e) = check_version(msg.protocol_version) {
            self.writer.send(&BrokerToClient::rejected(e.to_string())).await?;
            return Err(e);
        }

        if msg.message != ClientMessageType::Connect {
            self.writer
                .send(&BrokerToClient::rejected("expected connect"))
                .await?;
            return Err(ConnectionError::UnexpectedMessage(format!(
                "{:?}",
                msg.message
            )));
        }

        self.writer
            .send(&BrokerToClient::connected(self.address.clone()))
            .await?;
        info!(client = %self.address, "Client connected");
        Ok(())
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg: ClientMessage = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                msg = self.reader.next() => match msg {
                    Ok(msg) => msg,
                    Err(ConnectionError::ParseError(e)) => {
                        let failure = Failure::invalid_request(format!("malformed frame: {e}"));
                        self.writer.send(&BrokerToClient::failure(failure)).await?;
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };

            match msg.message {
                ClientMessageType::Request { payload } => {
                    let outcome = self.route(payload).await;
                    self.writer.send(&BrokerToClient::from_outcome(outcome)).await?;
                }
                ClientMessageType::Ping { seq } => {
                    self.writer.send(&BrokerToClient::Pong { seq }).await?;
                }
                ClientMessageType::Disconnect => return Ok(()),
                ClientMessageType::Connect => {
                    let failure = Failure::invalid_request("already connected");
                    self.writer.send(&BrokerToClient::failure(failure)).await?;
                }
            }
        }
    }

    async fn route(&self, payload: String) -> Result<String, Failure> {
        let reply = self
            .router
            .request(self.address.clone(), payload)
            .await
            .map_err(|e| Failure::new(ErrorCode::DaemonUnavailable, e.to_string()))?;

        match timeout(self.request_timeout, reply).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Failure::new(
                ErrorCode::DaemonUnavailable,
                "request dropped by broker",
            )),
            Err(_) => {
                self.router.abandon(self.address.clone()).await;
                Err(Failure::new(
                    ErrorCode::Timeout,
                    format!("no reply within {:?}", self.request_timeout),
                ))
            }
        }
    }
}

// ============================================================================
// Daemon connections
// ============================================================================

/// Handler for one daemon connection.
pub struct DaemonConnection<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    router: RouterHandle,
    connection: u64,
    cancel: CancellationToken,
}

impl<R, W> DaemonConnection<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a handler for one daemon connection; `connection` numbers it
    /// so a stale `DaemonLeft` cannot unregister a newer registration.
    pub fn new(
        reader: R,
        writer: W,
        router: RouterHandle,
        connection: u64,
        max_message_size: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader: FrameReader::new(reader, max_message_size),
            writer: FrameWriter::new(writer),
            router,
            connection,
            cancel,
        }
    }

    /// Registers the daemon, then relays until either side closes.
    pub async fn run(mut self) {
        let (identity, outbox) = match self.register().await {
            Ok(registered) => registered,
            Err(e) => {
                warn!(connection = self.connection, error = %e, "Daemon registration failed");
                return;
            }
        };

        let Self {
            mut reader,
            writer,
            router,
            connection,
            cancel,
        } = self;

        let writer_task = tokio::spawn(drain_outbox(writer, outbox, identity.clone()));

        let result = relay_replies(&mut reader, &router, &identity, &cancel).await;
        match result {
            Ok(()) | Err(ConnectionError::Eof) => {
                info!(identity = %identity, "Daemon disconnected");
            }
            Err(e) => warn!(identity = %identity, error = %e, "Daemon connection error"),
        }

        // Dropping the router's outbox sender ends the writer task
        router.daemon_left(identity, connection).await;
        writer_task.abort();
    }

    async fn register(
        &mut self,
    ) -> Result<(Identity, mpsc::Receiver<BrokerToDaemon>), ConnectionError> {
        let msg: DaemonMessage = timeout(HANDSHAKE_TIMEOUT, self.reader.next())
            .await
            .map_err(|_| ConnectionError::Timeout)??;

        if let Err(e) = check_version(msg.protocol_version) {
            self.writer.send(&BrokerToDaemon::rejected(e.to_string())).await?;
            return Err(e);
        }

        let DaemonMessageType::Register { identity } = msg.message else {
            self.writer
                .send(&BrokerToDaemon::rejected("expected register"))
                .await?;
            return Err(ConnectionError::UnexpectedMessage(format!(
                "{:?}",
                msg.message
            )));
        };

        let (tx, rx) = mpsc::channel(DAEMON_OUTBOX);
        if let Err(e) = self
            .router
            .register_daemon(identity.clone(), self.connection, tx)
            .await
        {
            self.writer.send(&BrokerToDaemon::rejected(e.to_string())).await?;
            return Err(ConnectionError::UnexpectedMessage(e.to_string()));
        }

        self.writer.send(&BrokerToDaemon::registered()).await?;
        Ok((identity, rx))
    }
}

async fn relay_replies<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
    router: &RouterHandle,
    identity: &Identity,
    cancel: &CancellationToken,
) -> Result<(), ConnectionError> {
    loop {
        let msg: DaemonMessage = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            msg = reader.next() => match msg {
                Ok(msg) => msg,
                Err(ConnectionError::ParseError(e)) => {
                    warn!(identity = %identity, error = %e, "Ignoring malformed daemon frame");
                    continue;
                }
                Err(e) => return Err(e),
            },
        };

        match msg.message {
            DaemonMessageType::Reply {
                client,
                request_id,
                payload,
            } => {
                router
                    .daemon_reply(identity.clone(), client, request_id, Ok(payload))
                    .await;
            }
            DaemonMessageType::Fail {
                client,
                request_id,
                code,
                message,
            } => {
                router
                    .daemon_reply(
                        identity.clone(),
                        client,
                        request_id,
                        Err(Failure::new(code, message)),
                    )
                    .await;
            }
            DaemonMessageType::Register { .. } => {
                warn!(identity = %identity, "Ignoring repeated register");
            }
        }
    }
}

async fn drain_outbox<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbox: mpsc::Receiver<BrokerToDaemon>,
    identity: Identity,
) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = writer.send(&frame).await {
            warn!(identity = %identity, error = %e, "Failed to forward to daemon");
            break;
        }
    }
}
