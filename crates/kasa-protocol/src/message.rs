//! Frames exchanged over the broker's two endpoints.
//!
//! Every frame is one JSON object on its own line. Client and daemon
//! frames carry the sender's protocol version; broker frames carry it
//! only on the handshake replies.
//!
//! ```text
//! client ──ClientMessage──▶ broker ──BrokerToDaemon──▶ daemon
//! client ◀─BrokerToClient── broker ◀──DaemonMessage─── daemon
//! ```

use crate::version::ProtocolVersion;
use kasa_core::{ClientAddress, ErrorCode, Failure, Identity, RequestId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Client -> Broker
// ============================================================================

/// Message types a client can send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessageType {
    /// Opening handshake
    Connect,

    /// Routed request: `<identity> <command> <args…>`
    Request {
        payload: String,
    },

    /// Liveness check answered by the broker itself
    Ping {
        seq: u64,
    },

    /// Client leaving gracefully
    Disconnect,
}

/// Messages sent from a client to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: ClientMessageType,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: ClientMessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect() -> Self {
        Self::new(ClientMessageType::Connect)
    }

    pub fn request(payload: impl Into<String>) -> Self {
        Self::new(ClientMessageType::Request {
            payload: payload.into(),
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(ClientMessageType::Ping { seq })
    }

    pub fn disconnect() -> Self {
        Self::new(ClientMessageType::Disconnect)
    }
}

// ============================================================================
// Broker -> Client
// ============================================================================

/// Messages sent from the broker to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToClient {
    /// Handshake accepted; `address` is the client's routing token
    Connected {
        protocol_version: ProtocolVersion,
        address: ClientAddress,
    },

    /// Handshake refused
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// Successful reply relayed from a daemon
    Reply { payload: String },

    /// Typed failure from the broker or a daemon
    Error { code: ErrorCode, message: String },

    Pong { seq: u64 },
}

impl BrokerToClient {
    pub fn connected(address: ClientAddress) -> Self {
        Self::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            address,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn reply(payload: impl Into<String>) -> Self {
        Self::Reply {
            payload: payload.into(),
        }
    }

    pub fn failure(failure: Failure) -> Self {
        Self::Error {
            code: failure.code,
            message: failure.message,
        }
    }

    /// Converts a routed outcome into the frame sent to the client.
    pub fn from_outcome(outcome: Result<String, Failure>) -> Self {
        match outcome {
            Ok(payload) => Self::reply(payload),
            Err(failure) => Self::failure(failure),
        }
    }
}

// ============================================================================
// Daemon -> Broker
// ============================================================================

/// Message types a daemon can send to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessageType {
    /// Opening handshake claiming an identity
    Register { identity: Identity },

    /// Successful result for a forwarded request
    Reply {
        client: ClientAddress,
        request_id: RequestId,
        payload: String,
    },

    /// Typed failure for a forwarded request
    Fail {
        client: ClientAddress,
        request_id: RequestId,
        code: ErrorCode,
        message: String,
    },
}

/// Messages sent from a daemon to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonMessage {
    pub protocol_version: ProtocolVersion,

    #[serde(flatten)]
    pub message: DaemonMessageType,
}

impl DaemonMessage {
    pub fn new(message: DaemonMessageType) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn register(identity: Identity) -> Self {
        Self::new(DaemonMessageType::Register { identity })
    }

    /// Builds the reply frame for a forwarded request's outcome.
    pub fn outcome(
        client: ClientAddress,
        request_id: RequestId,
        outcome: Result<String, Failure>,
    ) -> Self {
        let message = match outcome {
            Ok(payload) => DaemonMessageType::Reply {
                client,
                request_id,
                payload,
            },
            Err(failure) => DaemonMessageType::Fail {
                client,
                request_id,
                code: failure.code,
                message: failure.message,
            },
        };
        Self::new(message)
    }
}

// ============================================================================
// Broker -> Daemon
// ============================================================================

/// Messages sent from the broker to a daemon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToDaemon {
    /// Registration accepted
    Registered { protocol_version: ProtocolVersion },

    /// Registration refused (identity taken, version mismatch)
    Rejected {
        reason: String,
        protocol_version: ProtocolVersion,
    },

    /// A client request with the identity token stripped
    Forward {
        client: ClientAddress,
        request_id: RequestId,
        payload: String,
    },
}

impl BrokerToDaemon {
    pub fn registered() -> Self {
        Self::Registered {
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected {
            reason: reason.into(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}
