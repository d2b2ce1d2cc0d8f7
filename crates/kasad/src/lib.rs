//! Kasa daemon - identity-routing broker and per-device session daemons
//!
//! This crate provides both halves of the Kasa message fabric:
//! - `broker` - TCP broker routing client requests to daemons by identity
//! - `daemon` - session manager and broker link for one device family
//! - `worker` - per-device session workers with liveness and reconnect
//! - `link` - device collaborator traits and a simulated fleet
//! - `client` - broker client used by the CLI and tests
//! - `frame` - line-delimited JSON framing shared by every connection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         broker                              │
//! │  ┌──────────────────┐   ┌──────────┐   ┌────────────────┐   │
//! │  │ ClientConnection │──▶│  Router  │──▶│DaemonConnection│   │
//! │  └────────▲─────────┘   └──────────┘   └───────┬────────┘   │
//! └───────────┼────────────────────────────────────┼────────────┘
//!             │ client endpoint                    │ daemon endpoint
//!       BrokerClient                          BrokerLink
//!                                                  │
//! ┌────────────────────────────────────────────────▼────────────┐
//! │                    daemon (one per identity)                │
//! │   SessionManager ──▶ SessionWorker ──▶ DeviceLink (per key) │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod broker;
pub mod client;
pub mod daemon;
pub mod frame;
pub mod link;
pub mod worker;
