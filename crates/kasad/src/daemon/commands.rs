//! Session manager commands and errors.
//!
//! - `ManagerCommand`: Commands sent to the `SessionManager`
//! - `DaemonError`: Errors from the daemon's broker link

use kasa_core::{DeviceKey, Failure, SessionView};
use thiserror::Error;
use tokio::sync::oneshot;

use crate::frame::ConnectionError;

// ============================================================================
// Manager Commands
// ============================================================================

/// Commands sent to the session manager.
///
/// Each command carries a oneshot channel for its response. Replies for
/// device commands are produced off the manager task, so a slow device
/// never delays commands for other keys.
#[derive(Debug)]
pub enum ManagerCommand {
    /// Decode and run one command text (identity already stripped).
    ///
    /// Every outcome, success or failure, arrives on `respond_to`.
    Execute {
        command: String,
        respond_to: oneshot::Sender<Result<String, Failure>>,
    },

    /// Snapshot of every tracked session.
    Sessions {
        respond_to: oneshot::Sender<Vec<SessionView>>,
    },

    /// Tracked device keys, sorted.
    Keys {
        respond_to: oneshot::Sender<Vec<DeviceKey>>,
    },
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from the daemon's link to the broker.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// The broker refused our registration. Retrying cannot help.
    #[error("broker rejected registration: {0}")]
    Rejected(String),

    #[error("invalid identity '{0}'")]
    InvalidIdentity(String),

    #[error("broker connection failed: {0}")]
    Connection(#[from] ConnectionError),

    #[error("failed to dial broker at {endpoint}: {source}")]
    Dial {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("session manager is not running")]
    ManagerClosed,
}

impl DaemonError {
    /// Whether re-dialing the broker can succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Rejected(_) | Self::InvalidIdentity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_errors() {
        assert!(DaemonError::Rejected("identity GATT is already registered".into()).is_fatal());
        assert!(!DaemonError::Connection(ConnectionError::Eof).is_fatal());
        assert!(!DaemonError::ManagerClosed.is_fatal());
    }
}
