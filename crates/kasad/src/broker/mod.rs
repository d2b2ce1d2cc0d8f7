//! Identity-routing broker.
//!
//! The broker listens on two TCP endpoints. Daemons connect to the daemon
//! endpoint and register an identity; clients connect to the client
//! endpoint and send payloads whose first token names a daemon.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  Request   ┌──────────────┐  Forward   ┌──────────────┐
//! │ClientConnection│─────────▶│  RouterActor │──────────▶│DaemonConnection│
//! │  (per client)  │◀─────────│              │◀──────────│  (per daemon)  │
//! └──────────────┘  oneshot   └──────────────┘ DaemonReply└──────────────┘
//! ```
//!
//! The router owns the identity table and the pending-request map; the
//! connection handlers only translate between frames and router commands.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the server keeps accepting

mod connection;
mod router;

pub use connection::{ClientConnection, DaemonConnection, HANDSHAKE_TIMEOUT};
pub use router::{spawn_router, Outcome, RouterCommand, RouterHandle};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use kasa_core::{BrokerConfig, ClientAddress, ErrorCode, Identity};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Errors from the broker.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("failed to bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("identity {0} is already registered")]
    IdentityTaken(Identity),

    #[error("invalid identity '{0}'")]
    InvalidIdentity(Identity),

    #[error("router is not running")]
    RouterClosed,
}

impl BrokerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Bind { .. } => ErrorCode::AddressInUse,
            Self::IdentityTaken(_) | Self::InvalidIdentity(_) => ErrorCode::InvalidRequest,
            Self::RouterClosed => ErrorCode::DaemonUnavailable,
        }
    }
}

/// TCP server for both broker endpoints.
pub struct BrokerServer {
    client_listener: TcpListener,
    daemon_listener: TcpListener,
    router: RouterHandle,
    request_timeout: Duration,
    max_message_size: usize,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
}

impl BrokerServer {
    /// Binds both endpoints and starts the router.
    ///
    /// Binding happens here rather than in [`run`](Self::run) so callers
    /// learn the bound addresses (port 0 included) before serving.
    pub async fn bind(
        config: &BrokerConfig,
        cancel_token: CancellationToken,
    ) -> Result<Self, BrokerError> {
        let client_listener = bind(&config.client_endpoint).await?;
        let daemon_listener = bind(&config.daemon_endpoint).await?;

        Ok(Self {
            client_listener,
            daemon_listener,
            router: spawn_router(cancel_token.child_token()),
            request_timeout: config.request_timeout(),
            max_message_size: config.max_message_size,
            cancel_token,
            connection_counter: AtomicU64::new(0),
        })
    }

    pub fn client_addr(&self) -> Option<SocketAddr> {
        self.client_listener.local_addr().ok()
    }

    pub fn daemon_addr(&self) -> Option<SocketAddr> {
        self.daemon_listener.local_addr().ok()
    }

    pub fn router(&self) -> RouterHandle {
        self.router.clone()
    }

    /// Accepts connections on both endpoints until cancelled.
    pub async fn run(&self) {
        info!(
            clients = ?self.client_addr(),
            daemons = ?self.daemon_addr(),
            "Broker listening"
        );

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Broker shutdown requested");
                    break;
                }

                result = self.client_listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted client connection");
                        self.handle_client(stream);
                    }
                    Err(e) => error!(error = %e, "Failed to accept client connection"),
                },

                result = self.daemon_listener.accept() => match result {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Accepted daemon connection");
                        self.handle_daemon(stream);
                    }
                    Err(e) => error!(error = %e, "Failed to accept daemon connection"),
                },
            }
        }
    }

    fn handle_client(&self, stream: TcpStream) {
        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let handler = ClientConnection::new(
            reader,
            writer,
            self.router.clone(),
            ClientAddress::for_connection(conn_num),
            self.request_timeout,
            self.max_message_size,
            self.cancel_token.child_token(),
        );
        tokio::spawn(handler.run());
    }

    fn handle_daemon(&self, stream: TcpStream) {
        let conn_num = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = stream.into_split();
        let handler = DaemonConnection::new(
            reader,
            writer,
            self.router.clone(),
            conn_num,
            self.max_message_size,
            self.cancel_token.child_token(),
        );
        tokio::spawn(handler.run());
    }
}

async fn bind(endpoint: &str) -> Result<TcpListener, BrokerError> {
    TcpListener::bind(endpoint)
        .await
        .map_err(|source| BrokerError::Bind {
            endpoint: endpoint.to_string(),
            source,
        })
}
