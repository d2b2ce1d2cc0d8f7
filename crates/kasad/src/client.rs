//! Client for the broker's client endpoint.
//!
//! A [`BrokerClient`] sends one request at a time and waits for its reply,
//! which is what gives each client ordered replies.

use kasa_core::{ClientAddress, ErrorCode, Failure};
use kasa_protocol::{BrokerToClient, ClientMessage};
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::frame::{check_version, ConnectionError, FrameReader, FrameWriter};

/// Errors returned by [`BrokerClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("broker rejected connection: {0}")]
    Rejected(String),

    /// Typed failure from the broker or a daemon
    #[error(transparent)]
    Remote(Failure),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl ClientError {
    /// Wire code for remote failures; `None` for local transport errors.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Remote(failure) => Some(failure.code),
            _ => None,
        }
    }
}

/// A connected broker client.
pub struct BrokerClient {
    reader: FrameReader<OwnedReadHalf>,
    writer: FrameWriter<OwnedWriteHalf>,
    address: ClientAddress,
    next_seq: u64,
}

impl BrokerClient {
    /// Connects and performs the handshake.
    pub async fn connect(endpoint: &str, max_message_size: usize) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(endpoint)
            .await
            .map_err(|source| ClientError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        let (reader, writer) = stream.into_split();
        let mut reader = FrameReader::new(reader, max_message_size);
        let mut writer = FrameWriter::new(writer);

        writer.send(&ClientMessage::connect()).await?;

        let address = match reader.next::<BrokerToClient>().await? {
            BrokerToClient::Connected {
                protocol_version,
                address,
            } => {
                check_version(protocol_version)?;
                address
            }
            BrokerToClient::Rejected { reason, .. } => return Err(ClientError::Rejected(reason)),
            other => {
                return Err(ConnectionError::UnexpectedMessage(format!("{other:?}")).into());
            }
        };

        Ok(Self {
            reader,
            writer,
            address,
            next_seq: 0,
        })
    }

    /// The routing token the broker assigned to this client.
    pub fn address(&self) -> &ClientAddress {
        &self.address
    }

    /// Sends `<identity> <command> <args…>` and waits for the reply payload.
    pub async fn request(&mut self, payload: impl Into<String>) -> Result<String, ClientError> {
        self.writer.send(&ClientMessage::request(payload)).await?;

        match self.reader.next::<BrokerToClient>().await? {
            BrokerToClient::Reply { payload } => Ok(payload),
            BrokerToClient::Error { code, message } => {
                Err(ClientError::Remote(Failure::new(code, message)))
            }
            other => Err(ConnectionError::UnexpectedMessage(format!("{other:?}")).into()),
        }
    }

    /// Round-trips a ping through the broker.
    pub async fn ping(&mut self) -> Result<(), ClientError> {
        self.next_seq += 1;
        let seq = self.next_seq;
        self.writer.send(&ClientMessage::ping(seq)).await?;

        match self.reader.next::<BrokerToClient>().await? {
            BrokerToClient::Pong { seq: got } if got == seq => Ok(()),
            other => Err(ConnectionError::UnexpectedMessage(format!("{other:?}")).into()),
        }
    }

    /// Leaves gracefully.
    pub async fn disconnect(mut self) -> Result<(), ClientError> {
        self.writer.send(&ClientMessage::disconnect()).await?;
        Ok(())
    }
}
