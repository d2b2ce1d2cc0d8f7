//! Device daemon: session manager and broker link.
//!
//! # Architecture
//!
//! ```text
//!  broker ──Forward──▶ BrokerLink ──ManagerCommand──▶ SessionManager
//!         ◀──reply───  (outbox)   ◀────oneshot─────   │
//!                                                     │ HashMap<DeviceKey,
//!                                                     │   WorkerHandle>
//!                                                     ▼
//!                                            SessionWorker (per key)
//! ```
//!
//! The manager is the only task that touches the worker map. Workers that
//! terminate on their own report an [`Eviction`](crate::worker::Eviction)
//! and the manager drops them.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - Channel operations handle closure gracefully

mod actor;
mod broker_link;
mod commands;
mod handle;

pub use actor::{ManagerOptions, SessionManager};
pub use broker_link::BrokerLink;
pub use commands::{DaemonError, ManagerCommand};
pub use handle::ManagerHandle;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 256;
const EVENT_BUFFER: usize = 256;

/// Spawns the session manager and returns a handle for interaction.
pub fn spawn_manager(options: ManagerOptions, cancel: CancellationToken) -> ManagerHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);

    let manager = SessionManager::new(cmd_rx, event_tx.clone(), options, cancel);
    tokio::spawn(manager.run());

    ManagerHandle::new(cmd_tx, event_tx)
}
