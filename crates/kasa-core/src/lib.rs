//! Kasa Core - Shared types for the device broker
//!
//! This crate provides the core domain types shared between
//! the broker, the device daemons and the actor framework.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod ids;
pub mod session;

// Re-exports for convenience
pub use config::{ActorConfig, BrokerConfig, ConfigError, DaemonConfig, KasaConfig, SessionConfig};
pub use error::{ErrorCode, Failure};
pub use ids::{ChannelAddress, ClientAddress, DeviceKey, Identity, RequestId};
pub use session::{SessionState, SessionView};
