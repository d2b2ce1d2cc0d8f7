//! The daemon's connection to the broker.
//!
//! Dials the broker's daemon endpoint, registers the identity and relays
//! forwarded requests to the session manager. Each forwarded request is
//! answered from its own task; replies share one writer task through an
//! outbox channel.
//!
//! A lost broker connection is re-dialed with exponential backoff and the
//! identity registered again. A `rejected` registration ends the link.

use std::time::Duration;

use kasa_core::{DaemonConfig, Identity};
use kasa_protocol::{BrokerToDaemon, DaemonMessage};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{DaemonError, ManagerHandle};
use crate::frame::{check_version, ConnectionError, FrameReader, FrameWriter};

/// Replies buffered before request tasks wait on the writer
const OUTBOX_BUFFER: usize = 256;

/// Client of the broker's daemon endpoint.
pub struct BrokerLink {
    identity: Identity,
    endpoint: String,
    initial_delay: Duration,
    max_delay: Duration,
    max_message_size: usize,
    manager: ManagerHandle,
    cancel: CancellationToken,
}

impl BrokerLink {
    /// Creates a link for the identity and endpoint in `config`.
    ///
    /// Nothing is dialed until [`BrokerLink::run`].
    pub fn new(
        config: &DaemonConfig,
        max_message_size: usize,
        manager: ManagerHandle,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            identity: Identity::new(config.identity.clone()),
            endpoint: config.broker_endpoint.clone(),
            initial_delay: config.reconnect_initial_delay(),
            max_delay: config.reconnect_max_delay(),
            max_message_size,
            manager,
            cancel,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Keeps the daemon registered until cancelled.
    ///
    /// # Errors
    ///
    /// Returns only fatal errors (rejected registration, invalid identity).
    pub async fn run(&self) -> Result<(), DaemonError> {
        if !self.identity.is_valid() {
            return Err(DaemonError::InvalidIdentity(self.identity.to_string()));
        }

        let mut delay = self.initial_delay;

        while !self.cancel.is_cancelled() {
            match self.session(&mut delay).await {
                Ok(()) => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_in = ?delay,
                        "Broker link down"
                    );
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.max_delay);
        }

        info!(identity = %self.identity, "Broker link stopped");
        Ok(())
    }

    /// One dial-register-relay cycle. Resets `delay` once registered.
    async fn session(&self, delay: &mut Duration) -> Result<(), DaemonError> {
        let stream = TcpStream::connect(&self.endpoint)
            .await
            .map_err(|source| DaemonError::Dial {
                endpoint: self.endpoint.clone(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        let mut reader = FrameReader::new(reader, self.max_message_size);
        let mut writer = FrameWriter::new(writer);

        writer
            .send(&DaemonMessage::register(self.identity.clone()))
            .await?;

        match reader.next::<BrokerToDaemon>().await? {
            BrokerToDaemon::Registered { protocol_version } => check_version(protocol_version)?,
            BrokerToDaemon::Rejected { reason, .. } => return Err(DaemonError::Rejected(reason)),
            other => {
                return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")).into());
            }
        }

        info!(identity = %self.identity, broker = %self.endpoint, "Registered with broker");
        *delay = self.initial_delay;

        let (outbox, replies) = mpsc::channel(OUTBOX_BUFFER);
        let writer_task = tokio::spawn(drain_replies(writer, replies));

        let result = self.relay(&mut reader, &outbox).await;
        writer_task.abort();
        result
    }

    async fn relay(
        &self,
        reader: &mut FrameReader<tokio::net::tcp::OwnedReadHalf>,
        outbox: &mpsc::Sender<DaemonMessage>,
    ) -> Result<(), DaemonError> {
        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                frame = reader.next::<BrokerToDaemon>() => frame?,
            };

            match frame {
                BrokerToDaemon::Forward {
                    client,
                    request_id,
                    payload,
                } => {
                    debug!(client = %client, request_id = %request_id, command = %payload, "Forwarded request");
                    let manager = self.manager.clone();
                    let outbox = outbox.clone();
                    tokio::spawn(async move {
                        let outcome = manager.execute(payload).await;
                        let _ = outbox
                            .send(DaemonMessage::outcome(client, request_id, outcome))
                            .await;
                    });
                }
                other => warn!(frame = ?other, "Ignoring unexpected broker frame"),
            }
        }
    }
}

async fn drain_replies(
    mut writer: FrameWriter<tokio::net::tcp::OwnedWriteHalf>,
    mut replies: mpsc::Receiver<DaemonMessage>,
) {
    while let Some(msg) = replies.recv().await {
        if let Err(e) = writer.send(&msg).await {
            warn!(error = %e, "Failed to send reply to broker");
            break;
        }
    }
}
