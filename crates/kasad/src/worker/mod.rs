//! Per-device session workers.
//!
//! A session worker owns one [`DeviceLink`] and serializes every command
//! for its device. It runs a bounded-retry handshake, then waits on its
//! private command channel with an idle timeout that doubles as the
//! liveness interval.
//!
//! ```text
//!   WorkerHandle ──WorkerCommand──▶ SessionWorker ──▶ DeviceLink
//!        ▲                               │
//!        └──── watch<SessionView> ───────┤
//!                                        ├──▶ broadcast<SessionEvent>
//!                                        └──▶ Eviction (terminal only)
//! ```
//!
//! State changes are published on the handle's `watch` channel and as
//! [`SessionEvent`]s. A worker that reaches `Disconnected` on its own
//! reports an [`Eviction`] so the daemon drops it from its map.

mod actor;
mod handle;

pub use actor::SessionWorker;
pub use handle::WorkerHandle;

use std::fmt;
use std::time::Duration;

use kasa_core::{DeviceKey, ErrorCode, Failure, SessionConfig, SessionState, SessionView};
use kasa_protocol::DeviceOp;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::link::{DeviceLink, LinkError};

// ============================================================================
// Commands
// ============================================================================

/// Commands accepted by a session worker.
#[derive(Debug)]
pub enum WorkerCommand {
    /// Run one device operation.
    Execute {
        op: DeviceOp,
        respond_to: oneshot::Sender<Result<String, SessionError>>,
    },

    /// Close the device and terminate the worker.
    Disconnect {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors surfaced by a session worker.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("could not connect to {key} after {attempts} attempts")]
    ConnectFailed { key: DeviceKey, attempts: u32 },

    #[error("session for {0} is not connected")]
    NotConnected(DeviceKey),

    #[error("'{operation}' on {key} timed out after {after:?}")]
    Timeout {
        key: DeviceKey,
        operation: &'static str,
        after: Duration,
    },

    /// The request was refused before reaching the device.
    #[error("{operation} on {key} rejected: {reason}")]
    Rejected {
        key: DeviceKey,
        operation: &'static str,
        reason: String,
    },

    #[error(transparent)]
    Link(#[from] LinkError),
}

impl SessionError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::ConnectFailed { .. } => ErrorCode::ConnectFailed,
            Self::NotConnected(_) => ErrorCode::NotConnected,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Rejected { .. } => ErrorCode::InvalidRequest,
            Self::Link(err) => err.code(),
        }
    }
}

impl From<SessionError> for Failure {
    fn from(err: SessionError) -> Self {
        Failure::new(err.code(), err.to_string())
    }
}

// ============================================================================
// Events
// ============================================================================

/// Why a worker left the daemon's map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    /// Handshake retries exhausted
    ConnectFailed,
    /// Liveness probe failed and the single reconnect failed
    ReconnectFailed,
    /// Explicit `disconnect`
    Disconnected,
}

impl fmt::Display for EvictionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectFailed => write!(f, "handshake retries exhausted"),
            Self::ReconnectFailed => write!(f, "reconnect failed"),
            Self::Disconnected => write!(f, "disconnected on request"),
        }
    }
}

/// Observable session lifecycle events.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A worker was created for `key`
    Spawned { key: DeviceKey },

    /// A worker moved to a new state
    StateChanged { key: DeviceKey, state: SessionState },

    /// A liveness probe failed; one reconnect attempt follows
    Reconnecting { key: DeviceKey },

    /// A worker was removed from the daemon's map
    Evicted {
        key: DeviceKey,
        reason: EvictionReason,
    },
}

/// Report from a worker that terminated on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Eviction {
    pub key: DeviceKey,
    pub worker_id: u64,
    pub reason: EvictionReason,
}

/// Channels a worker reports to.
#[derive(Clone)]
pub struct Supervisor {
    pub events: broadcast::Sender<SessionEvent>,
    pub evictions: mpsc::UnboundedSender<Eviction>,
    pub cancel: CancellationToken,
}

// ============================================================================
// Spawning
// ============================================================================

/// Spawns a session worker for `key` and returns its handle.
///
/// The handshake starts immediately; commands sent before it completes
/// are queued behind it.
pub fn spawn_worker(
    worker_id: u64,
    key: DeviceKey,
    link: Box<dyn DeviceLink>,
    config: SessionConfig,
    supervisor: Supervisor,
) -> WorkerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.command_buffer.max(1));
    let attempts = config.connect_retries.max(1);
    let (state_tx, state_rx) = watch::channel(SessionView::connecting(key.clone()));

    let worker = SessionWorker::new(worker_id, key.clone(), link, config, cmd_rx, state_tx, supervisor);
    tokio::spawn(worker.run());

    WorkerHandle::new(worker_id, key, cmd_tx, state_rx, attempts)
}
