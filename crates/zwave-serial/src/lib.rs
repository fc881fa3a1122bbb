//! Serial API driver for Z-Wave mesh network controllers
//!
//! This crate talks to a Z-Wave controller stick over its serial link:
//! it frames and checksums traffic, queues outbound work with one job in
//! flight at a time, correlates asynchronous callbacks and responses, and
//! keeps a registry of the nodes on the network.
//!
//! # Architecture
//!
//! The driver operates in four layers:
//!
//! 1. **Transport** - Byte link to the controller ([`Transport`])
//! 2. **Framing** - SOF/LEN/DIR/FUNC/CHK frames and control bytes ([`frame`])
//! 3. **Protocol Engine** - Job queue, wake-up staging, query intents and
//!    frame dispatch ([`ProtocolEngine`])
//! 4. **Application** - Node commands through [`DriverHandle`] and decoded
//!    reports through a [`ReportHandler`]
//!
//! # Quick Start
//!
//! ```rust,ignore
//! // Enable the `serial` feature to use SerialTransport
//! // Cargo.toml: zwave-serial = { version = "0.1", features = ["serial"] }
//!
//! use std::sync::Arc;
//! use zwave_serial::{DriverConfigBuilder, NoopHandler, ProtocolEngine, SerialTransport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = DriverConfigBuilder::new()
//!         .serial_port("/dev/ttyACM0")
//!         .build();
//!
//!     let transport = SerialTransport::from_config(&config.transport);
//!     let (engine, handle) = ProtocolEngine::new(transport, &config, Arc::new(NoopHandler));
//!     let engine_task = tokio::spawn(engine.run());
//!
//!     // Switch node 5 on
//!     handle.basic_set(5, 0xFF)?;
//!
//!     for line in handle.list_device_descriptors().iter() {
//!         println!("{}", line);
//!     }
//!
//!     handle.shutdown()?;
//!     engine_task.await??;
//!     Ok(())
//! }
//! ```
//!
//! # Features
//!
//! - `serial` - Serial port transport (requires `libudev-dev` on Linux)
//!
//! # Flow Control
//!
//! 1. A handle operation validates its arguments and queues a job, or stages
//!    it when the target node is asleep
//! 2. The engine writes the head job and waits for the controller's ACK
//! 3. Jobs expecting a response or callback stay in flight until it arrives
//! 4. Jobs not completed in time are retransmitted, then dropped
//! 5. A wake-up notification releases the node's staged jobs
//!
//! # Protocol Details
//!
//! Data frames on the wire:
//! - Byte 0: Start of frame `0x01`
//! - Byte 1: Length of direction, function and arguments
//! - Byte 2: Direction (`0x00` request, `0x01` response)
//! - Byte 3: Function identifier
//! - Bytes 4+: Arguments
//! - Last byte: XOR checksum of the length byte through the last argument
//!
//! Single control bytes acknowledge frames: ACK `0x06`, NAK `0x15`,
//! CAN `0x18`.

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

// Link and framing
pub mod config;
pub mod error;
pub mod frame;
pub mod function;
pub mod transport;

// Outbound work
pub mod intent;
pub mod job;
pub mod wakeup;

// Network model
pub mod command_class;
pub mod memory;
pub mod registry;

// Engine
pub mod engine;
pub mod handler;
pub mod session;

// Testing utilities
pub mod test_utils;

pub use config::{DriverConfig, DriverConfigBuilder, ProtocolConfig, ReconnectConfig, TransportConfig};
pub use error::{DriverError, Result};
pub use frame::{ControlByte, Direction, Frame, FrameError, FrameReader, Inbound};
pub use function::FunctionId;
pub use transport::{ConnectionState, Transport};

#[cfg(feature = "serial")]
pub use transport::{find_controller_device, list_available_devices, DeviceInfo, SerialTransport};

pub use intent::{Intent, IntentKind, IntentTracker};
pub use job::{CallbackKind, Job, JobQueue};
pub use wakeup::WakeupQueue;

pub use command_class::{CommandReport, ScaledValue};
pub use memory::MemorySnapshot;
pub use registry::{DeviceDescriptors, DeviceTemplate, Node, NodeRegistry};

pub use engine::{ProtocolEngine, StepOutcome};
pub use handler::{NoopHandler, ReportHandler};
pub use session::{ControllerInfo, Delivery, DriverHandle, DriverStats, EngineState};

pub use test_utils::{MockTransport, RecordingHandler, ReportEvent, TestFixture};

// Protocol constants re-exports
pub use config::{
    ACK, BROADCAST_NODE_ID, CAN, DEFAULT_BAUD_RATE, MAX_FRAME_PAYLOAD, MAX_NODE_ID, NAK, SOF,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }

    #[test]
    fn test_constants() {
        assert_eq!(SOF, 0x01);
        assert_eq!(ACK, 0x06);
        assert_eq!(NAK, 0x15);
        assert_eq!(CAN, 0x18);
        assert_eq!(MAX_FRAME_PAYLOAD, 254);
        assert_eq!(BROADCAST_NODE_ID, 0xFF);
    }
}
