//! Device collaborators consumed by session workers.
//!
//! The byte-level protocols (Bluetooth GATT, WeMo switches) live behind
//! these traits. A session worker owns exactly one [`DeviceLink`]; the
//! daemon creates links through a [`LinkFactory`] and scans through a
//! [`Discovery`].
//!
//! [`sim::SimFleet`] implements all three in memory.

pub mod sim;

use std::time::Duration;

use async_trait::async_trait;
use kasa_core::{DeviceKey, ErrorCode, Failure};
use thiserror::Error;

/// Errors reported by a device link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// The device did not answer a connect attempt.
    #[error("device {0} unreachable")]
    Unreachable(DeviceKey),

    /// The link was lost.
    #[error("link to {0} lost")]
    Disconnected(DeviceKey),

    /// The device does not support this operation.
    #[error("{device} does not support '{operation}'")]
    Unsupported {
        device: DeviceKey,
        operation: &'static str,
    },

    /// The device failed the operation.
    #[error("device error: {0}")]
    Device(String),
}

impl LinkError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unreachable(_) => ErrorCode::ConnectFailed,
            Self::Disconnected(_) => ErrorCode::NotConnected,
            Self::Unsupported { .. } => ErrorCode::InvalidRequest,
            Self::Device(_) => ErrorCode::DeviceError,
        }
    }
}

impl From<LinkError> for Failure {
    fn from(err: LinkError) -> Self {
        Failure::new(err.code(), err.to_string())
    }
}

/// A connection to one physical device.
///
/// Calls may hang on a misbehaving device; callers bound every call with
/// a deadline.
#[async_trait]
pub trait DeviceLink: Send {
    /// Opens the connection.
    async fn connect(&mut self, key: &DeviceKey) -> Result<(), LinkError>;

    /// Cheap liveness check of an open connection.
    async fn probe(&mut self) -> Result<(), LinkError>;

    async fn read(&mut self, addr: &str) -> Result<String, LinkError>;

    async fn write(&mut self, addr: &str, value: &str) -> Result<(), LinkError>;

    /// Switches a power-switch device on or off.
    async fn set_power(&mut self, on: bool) -> Result<(), LinkError>;

    /// Returns whether a power-switch device is on.
    async fn power(&mut self) -> Result<bool, LinkError>;

    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Creates an unconnected link for a device key.
pub trait LinkFactory: Send + Sync {
    fn create(&self, key: &DeviceKey) -> Box<dyn DeviceLink>;
}

/// Scans for reachable devices.
#[async_trait]
pub trait Discovery: Send + Sync {
    /// Returns the keys of devices that answered within `window`.
    async fn discover(&self, window: Duration) -> Result<Vec<DeviceKey>, LinkError>;
}
