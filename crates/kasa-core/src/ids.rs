//! Identifier newtypes used for routing.
//!
//! - [`Identity`]: stable name a daemon answers to at the broker ("GATT", "WeMo")
//! - [`ClientAddress`]: opaque per-connection token the broker assigns to clients
//! - [`DeviceKey`]: distinguishes devices of the same kind (e.g. a Bluetooth MAC)
//! - [`RequestId`]: correlates a forwarded request with its reply
//! - [`ChannelAddress`]: in-process channel address used by the switchboard

use serde::{Deserialize, Serialize};
use std::fmt;

/// Stable name a daemon registers under at the broker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Identity(String);

impl Identity {
    /// Creates a new identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for identities that cannot be routed to.
    ///
    /// Identities are matched against the first whitespace-delimited token
    /// of a client payload, so they must be non-empty and whitespace-free.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque routing token for a connected client.
///
/// Assigned by the broker when the client connects and only meaningful
/// for the lifetime of that connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientAddress(String);

impl ClientAddress {
    /// Creates an address from a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Creates the address for the n-th accepted connection.
    pub fn for_connection(connection_number: u64) -> Self {
        Self(format!("client-{connection_number}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one physical device within a daemon.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceKey(String);

impl DeviceKey {
    /// Creates a new device key.
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a forwarded request with the daemon's reply.
///
/// Allocated by the broker, monotonically increasing per broker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Address of an in-process channel.
///
/// Actor outputs live at `inproc://<name>/out`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelAddress(String);

/// Scheme prefix for in-process channel addresses.
pub const INPROC_SCHEME: &str = "inproc://";

impl ChannelAddress {
    /// Creates an address from a raw string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derives the output address of the actor with the given name.
    pub fn actor_output(name: &str) -> Self {
        Self(format!("{INPROC_SCHEME}{name}/out"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ChannelAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
