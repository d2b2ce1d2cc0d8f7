//! Device session lifecycle types.
//!
//! A session is the live state of the connection to one physical device,
//! owned exclusively by one session worker.
//!
//! ```text
//! Connecting ──▶ Connected ──▶ Idle ◀──▶ Busy
//!     │                         │         │
//!     │                         ▼         ▼
//!     │                     Reconnecting ─┘
//!     │                         │
//!     ▼                         ▼
//! Disconnected (terminal) ◀─────┘
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::DeviceKey;

/// Liveness state of a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Bounded-retry connect handshake in progress
    Connecting,
    /// Handshake succeeded, worker entering its command loop
    Connected,
    /// Waiting for a command
    Idle,
    /// Executing a command
    Busy,
    /// Probe failed, one reconnect attempt in progress
    Reconnecting,
    /// Terminal: link closed, worker gone
    Disconnected,
}

impl SessionState {
    /// Returns true if no further transitions are possible.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Disconnected)
    }

    /// Returns true once the handshake has completed and before termination.
    #[must_use]
    pub fn is_established(&self) -> bool {
        matches!(
            self,
            Self::Connected | Self::Idle | Self::Busy | Self::Reconnecting
        )
    }

    /// Returns a short lowercase label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Reconnecting => "reconnecting",
            Self::Disconnected => "disconnected",
        }
    }

    /// Returns true if moving from `self` to `next` is a legal transition.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Connecting, Connected) => true,
            (Connected, Idle) | (Connected, Busy) => true,
            (Idle, Busy) | (Busy, Idle) => true,
            (Idle, Reconnecting) | (Busy, Reconnecting) => true,
            (Reconnecting, Idle) | (Reconnecting, Busy) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Read-only snapshot of a session, for listing and diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionView {
    /// Device this session is bound to
    pub key: DeviceKey,
    /// Current liveness state
    pub state: SessionState,
    /// When the session was created
    pub started_at: DateTime<Utc>,
    /// Last command or successful probe
    pub last_activity: DateTime<Utc>,
    /// Number of reconnect cycles performed so far
    pub reconnects: u32,
}

impl SessionView {
    /// Creates a view for a session that is just starting its handshake.
    pub fn connecting(key: DeviceKey) -> Self {
        let now = Utc::now();
        Self {
            key,
            state: SessionState::Connecting,
            started_at: now,
            last_activity: now,
            reconnects: 0,
        }
    }

    /// Renders the compact `key:state` form used in text replies.
    pub fn summary(&self) -> String {
        format!("{}:{}", self.key, self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnected_is_terminal() {
        assert!(SessionState::Disconnected.is_terminal());
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Idle));
        assert!(!SessionState::Disconnected.can_transition_to(SessionState::Disconnected));
    }

    #[test]
    fn test_reconnecting_reachable_from_idle_and_busy() {
        assert!(SessionState::Idle.can_transition_to(SessionState::Reconnecting));
        assert!(SessionState::Busy.can_transition_to(SessionState::Reconnecting));
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Reconnecting));
    }

    #[test]
    fn test_handshake_must_complete_before_idle() {
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Idle));
        assert!(SessionState::Connecting.can_transition_to(SessionState::Connected));
        assert!(SessionState::Connecting.can_transition_to(SessionState::Disconnected));
    }

    #[test]
    fn test_established_states() {
        assert!(!SessionState::Connecting.is_established());
        assert!(SessionState::Idle.is_established());
        assert!(SessionState::Reconnecting.is_established());
        assert!(!SessionState::Disconnected.is_established());
    }

    #[test]
    fn test_view_summary() {
        let view = SessionView::connecting(DeviceKey::new("kitchen"));
        assert_eq!(view.summary(), "kitchen:connecting");
    }
}
