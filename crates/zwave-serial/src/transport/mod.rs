//! Byte transports for the controller link
//!
//! The engine only needs bounded reads and whole writes, so anything that
//! can move bytes to and from the controller implements [`Transport`]:
//!
//! - [`SerialTransport`] - USB/UART serial port (requires `serial` feature)
//! - [`MockTransport`](crate::test_utils::MockTransport) - scripted bytes for tests
//!
//! # Feature Requirements
//!
//! - `serial`: Requires `libudev-dev` and `pkg-config` on Linux
//!   ```bash
//!   # Ubuntu/Debian
//!   apt install libudev-dev pkg-config
//!   ```

#[cfg(feature = "serial")]
mod serial;

#[cfg(feature = "serial")]
pub use serial::{find_controller_device, list_available_devices, DeviceInfo, SerialTransport};

use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

/// Half-duplex byte link to the controller
///
/// Only the engine task reads from or writes to a transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the link
    async fn open(&mut self) -> Result<()>;

    /// Close the link
    async fn close(&mut self) -> Result<()>;

    /// Check if the link is open
    fn is_open(&self) -> bool;

    /// Read available bytes into `buf`, waiting at most `timeout`
    ///
    /// Returns `Ok(0)` when nothing arrived before the timeout.
    /// Returns `Err` when the link failed.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Write all of `data`
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Get the transport name (for logging)
    fn name(&self) -> &str;
}

/// Connection state for transports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected
    Disconnected,
    /// Opening in progress
    Connecting,
    /// Link is open
    Connected,
    /// Link lost, reopening
    Reconnecting,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting => write!(f, "reconnecting"),
        }
    }
}
