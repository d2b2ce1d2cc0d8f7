//! Typed failure taxonomy shared by every hop of the request path.
//!
//! Every failure a client can observe is an [`ErrorCode`] plus a human
//! readable message. The codes are stable on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable failure codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Device unreachable after bounded retries.
    ConnectFailed,
    /// Command issued against a session that could not be brought back.
    NotConnected,
    /// Device key has no active session.
    UnknownDevice,
    /// No daemon is registered under the requested identity.
    UnknownIdentity,
    /// Channel address already bound by another live actor.
    AddressInUse,
    /// A wait bound was exceeded.
    Timeout,
    /// Payload could not be decoded into a command.
    InvalidRequest,
    /// The device rejected or failed the operation.
    DeviceError,
    /// The daemon went away while the request was in flight.
    DaemonUnavailable,
}

impl ErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectFailed => "connect_failed",
            Self::NotConnected => "not_connected",
            Self::UnknownDevice => "unknown_device",
            Self::UnknownIdentity => "unknown_identity",
            Self::AddressInUse => "address_in_use",
            Self::Timeout => "timeout",
            Self::InvalidRequest => "invalid_request",
            Self::DeviceError => "device_error",
            Self::DaemonUnavailable => "daemon_unavailable",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure as delivered to the requesting client.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct Failure {
    /// Machine-readable failure class
    pub code: ErrorCode,
    /// Human-readable detail
    pub message: String,
}

impl Failure {
    /// Creates a new failure.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Failure for a request aimed at a device with no session.
    pub fn unknown_device(key: impl fmt::Display) -> Self {
        Self::new(ErrorCode::UnknownDevice, format!("no active session for {key}"))
    }

    /// Failure for a request aimed at an identity with no daemon.
    pub fn unknown_identity(identity: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::UnknownIdentity,
            format!("no daemon registered as {identity}"),
        )
    }

    /// Failure for an undecodable payload.
    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, reason)
    }
}
