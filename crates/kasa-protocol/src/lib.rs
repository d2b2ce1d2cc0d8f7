//! Kasa Protocol - Wire protocol for broker communication
//!
//! This crate provides the line-delimited JSON frames exchanged between
//! clients, the broker and daemons, plus the whitespace-tokenized command
//! grammar carried inside request payloads.

pub mod command;
pub mod message;
pub mod version;

pub use command::{split_target, CommandError, DaemonCommand, DeviceOp, RoutedPayload};
pub use message::{
    BrokerToClient, BrokerToDaemon, ClientMessage, ClientMessageType, DaemonMessage,
    DaemonMessageType,
};
pub use version::ProtocolVersion;
