//! Protocol versioning for clients and daemons talking to the broker.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Protocol version carried by every opening frame.
///
/// `major.minor`: peers with different majors cannot talk to each other,
/// minors only ever add optional fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
}

impl ProtocolVersion {
    /// Version spoken by this build.
    pub const CURRENT: ProtocolVersion = ProtocolVersion { major: 1, minor: 0 };

    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }

    /// Parses a version string like "1.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError::InvalidFormat(s.to_string());

        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        let major = major.parse::<u16>().map_err(|_| invalid())?;
        let minor = minor.parse::<u16>().map_err(|_| invalid())?;

        Ok(Self { major, minor })
    }

    /// Peers are compatible when their major versions match.
    pub fn is_compatible_with(&self, other: &ProtocolVersion) -> bool {
        self.major == other.major
    }

    /// Checks a peer's version against [`ProtocolVersion::CURRENT`].
    pub fn check_peer(peer: ProtocolVersion) -> Result<(), VersionError> {
        if peer.is_compatible_with(&Self::CURRENT) {
            Ok(())
        } else {
            Err(VersionError::Incompatible {
                got: peer.to_string(),
                expected: Self::CURRENT.to_string(),
            })
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible protocol version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = ProtocolVersion::parse("1.3").unwrap();
        assert_eq!(v, ProtocolVersion::new(1, 3));
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(ProtocolVersion::parse("1").is_err());
        assert!(ProtocolVersion::parse("1.0.0").is_err());
        assert!(ProtocolVersion::parse("one.two").is_err());
    }

    #[test]
    fn test_check_peer() {
        assert!(ProtocolVersion::check_peer(ProtocolVersion::new(1, 7)).is_ok());
        let err = ProtocolVersion::check_peer(ProtocolVersion::new(2, 0)).unwrap_err();
        assert!(err.to_string().contains("2.0"));
    }
}
