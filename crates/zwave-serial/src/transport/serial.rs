//! Serial port transport for controller sticks
//!
//! Async serial I/O with tokio-serial. Framing is left to the engine's
//! [`FrameReader`](crate::frame::FrameReader); this layer only moves bytes.

use crate::config::DEFAULT_BAUD_RATE;
use crate::error::{DriverError, Result};
use crate::transport::{ConnectionState, Transport};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Common serial port paths for controller sticks on different platforms
const COMMON_DEVICE_PATHS: &[&str] = &[
    // Linux
    "/dev/ttyACM0",
    "/dev/ttyACM1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/serial/by-id/usb-0658_0200*",
    // macOS
    "/dev/tty.usbmodem*",
    "/dev/cu.usbmodem*",
    "/dev/cu.SLAB_USBtoUART*",
];

/// USB vendor ids of common controller sticks
/// (Sigma Designs, Silicon Labs CP210x, Aeotec)
const KNOWN_VENDOR_IDS: &[u16] = &[0x0658, 0x10C4, 0x0403];

/// Serial transport to a controller stick
pub struct SerialTransport {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Serial stream (when open)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Transport name for logging
    name: String,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            stream: None,
            state: ConnectionState::Disconnected,
            name,
        }
    }

    /// Create from the transport section of a driver config
    pub fn from_config(config: &crate::config::TransportConfig) -> Self {
        Self::new(&config.port).with_baud_rate(config.baud_rate)
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn open(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Opening serial port");

        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(DriverError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                DriverError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;

        info!(port = %self.port_path.display(), "Serial port open");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.flush().await;
        }

        self.state = ConnectionState::Disconnected;
        info!(port = %self.port_path.display(), "Serial port closed");
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(DriverError::Disconnected)?;

        match tokio::time::timeout(timeout, stream.read(buf)).await {
            Err(_) => Ok(0),
            Ok(Ok(0)) => {
                // EOF - stick unplugged
                self.state = ConnectionState::Disconnected;
                Err(DriverError::Disconnected)
            }
            Ok(Ok(n)) => {
                trace!(bytes = n, "Read from serial port");
                Ok(n)
            }
            Ok(Err(e))
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
                ) =>
            {
                Ok(0)
            }
            Ok(Err(e)) => {
                error!(error = %e, "Serial read error");
                self.state = ConnectionState::Disconnected;
                Err(DriverError::ReadError(e.to_string()))
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(DriverError::Disconnected)?;

        trace!(bytes = data.len(), "Writing to serial port");
        stream.write_all(data).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            DriverError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| DriverError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .finish()
    }
}

/// Information about a detected serial device
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    /// Path to the device (e.g., /dev/ttyACM0)
    pub path: String,
    /// Device type description
    pub device_type: String,
    /// USB Vendor ID (if available)
    pub vendor_id: Option<u16>,
    /// USB Product ID (if available)
    pub product_id: Option<u16>,
    /// Product name (if available)
    pub product_name: Option<String>,
    /// Whether this is likely a controller stick
    pub is_likely_controller: bool,
}

impl DeviceInfo {
    fn from_serial_port(port: &serialport::SerialPortInfo) -> Self {
        use serialport::SerialPortType;

        let (device_type, vendor_id, product_id, product_name) = match &port.port_type {
            SerialPortType::UsbPort(usb) => (
                "USB".to_string(),
                Some(usb.vid),
                Some(usb.pid),
                usb.product.clone(),
            ),
            SerialPortType::PciPort => ("PCI".to_string(), None, None, None),
            SerialPortType::BluetoothPort => ("Bluetooth".to_string(), None, None, None),
            SerialPortType::Unknown => ("Unknown".to_string(), None, None, None),
        };

        Self {
            path: port.port_name.clone(),
            device_type,
            vendor_id,
            product_id,
            product_name,
            is_likely_controller: is_likely_controller_port(port),
        }
    }
}

fn is_likely_controller_port(port: &serialport::SerialPortInfo) -> bool {
    match &port.port_type {
        serialport::SerialPortType::UsbPort(usb) => {
            if KNOWN_VENDOR_IDS.contains(&usb.vid) {
                debug!(vid = usb.vid, pid = usb.pid, "USB device matches known vendor");
                return true;
            }
            usb.product.as_deref().is_some_and(|product| {
                let product = product.to_lowercase();
                product.contains("z-wave") || product.contains("zwave") || product.contains("uzb")
            })
        }
        _ => false,
    }
}

/// Find a connected controller stick by scanning serial ports
///
/// Returns the path to the first likely device, falling back to common
/// device paths.
pub fn find_controller_device() -> Option<String> {
    if let Ok(ports) = serialport::available_ports() {
        if let Some(port) = ports.iter().find(|p| is_likely_controller_port(p)) {
            info!(path = %port.port_name, "Found likely controller stick");
            return Some(port.port_name.clone());
        }
    }

    for pattern in COMMON_DEVICE_PATHS {
        if let Ok(entries) = glob::glob(pattern) {
            if let Some(entry) = entries.flatten().find(|e| e.exists()) {
                let path = entry.to_string_lossy().to_string();
                debug!(path = %path, "Found serial port");
                return Some(path);
            }
        }
    }

    None
}

/// List all available serial ports
pub fn list_available_devices() -> Vec<DeviceInfo> {
    serialport::available_ports()
        .map(|ports| ports.iter().map(DeviceInfo::from_serial_port).collect())
        .unwrap_or_default()
}
