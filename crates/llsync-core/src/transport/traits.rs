//! BLE transport abstraction.
//!
//! The platform Bluetooth adapter (btleplug, CoreBluetooth bridge, a
//! vendor SDK, ...) implements [`BleTransport`]; the protocol core only
//! needs connect/write/notify primitives. Frames surfaced by
//! `poll_notify` must preserve the link's delivery order.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connect failed: {0}")]
    ConnectFailed(String),

    #[error("write failed: {0}")]
    WriteFailed(String),

    #[error("device disconnected")]
    Disconnected,

    #[error("no notification within {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("platform does not allow explicit MTU negotiation")]
    SetMtuUnsupported,

    #[error("MTU negotiation failed: {0}")]
    SetMtuFailed(String),
}

/// Write characteristics exposed by the LLSync service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTarget {
    /// Pairing and authentication exchanges.
    DeviceInfo,
    /// Data-model control and report acknowledgements.
    DeviceData,
    /// Firmware update traffic.
    Ota,
}

/// Abstract BLE link to one peripheral.
///
/// This trait enables:
/// - Production implementations over a platform Bluetooth stack
/// - Mock implementation for unit testing
pub trait BleTransport: Send + Sync {
    /// Establish the physical connection.
    fn connect(&self) -> Result<(), TransportError>;

    /// Tear the connection down.
    fn disconnect(&self) -> Result<(), TransportError>;

    /// Whether the link is currently up.
    fn is_connected(&self) -> bool;

    /// Write one frame to the given characteristic.
    fn write(&self, target: WriteTarget, data: &[u8]) -> Result<(), TransportError>;

    /// Block for up to `timeout` waiting for the next notify frame.
    /// Returns [`TransportError::Timeout`] when none arrives in time and
    /// [`TransportError::Disconnected`] when the link drops.
    fn poll_notify(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Request an MTU change on the link.
    fn set_mtu(&self, mtu: usize) -> Result<(), TransportError>;

    /// Whether the platform permits explicit MTU negotiation at all
    /// (iOS-class adapters return `false`).
    fn supports_mtu_negotiation(&self) -> bool {
        true
    }
}
