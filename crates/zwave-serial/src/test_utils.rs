//! Test utilities for driving the engine without a controller stick
//!
//! [`MockTransport`] is a scripted byte link. Clones share state, so a test
//! keeps one clone to feed inbound bytes and inspect written frames while the
//! engine owns the other. Frame builders produce the controller's side of
//! common exchanges.
//!
//! # Example
//!
//! ```rust,ignore
//! use zwave_serial::test_utils::{response_frame, TestFixture};
//! use zwave_serial::FunctionId;
//!
//! #[tokio::test(start_paused = true)]
//! async fn test_version_exchange() {
//!     let fixture = TestFixture::new();
//!     let (mut engine, handle) = fixture.start().await.unwrap();
//!
//!     handle.send_request(FunctionId::GetVersion, &[]).unwrap();
//!     engine.step().await.unwrap();
//!     fixture.transport.push_inbound(&[0x06]);
//!     fixture.transport.push_inbound(&response_frame(FunctionId::GetVersion, b"Z-Wave 4.05\0\x01"));
//!     engine.step().await.unwrap();
//! }
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::command_class::ScaledValue;
use crate::config::{DriverConfig, DriverConfigBuilder};
use crate::engine::ProtocolEngine;
use crate::error::{DriverError, Result};
use crate::frame::{Direction, Frame};
use crate::function::{update_status, FunctionId};
use crate::handler::ReportHandler;
use crate::session::DriverHandle;
use crate::transport::Transport;

#[derive(Debug, Default)]
struct MockState {
    open: bool,
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
    read_chunk: Option<usize>,
    fail_opens: u32,
    fail_next_read: bool,
    fail_next_write: bool,
    opens: u32,
}

/// Mock transport for testing
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    data_ready: Arc<Notify>,
}

impl MockTransport {
    /// Create a closed mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes as if the controller had sent them
    pub fn push_inbound(&self, bytes: &[u8]) {
        self.state.lock().inbound.extend(bytes.iter().copied());
        self.data_ready.notify_one();
    }

    /// Everything written so far, one entry per write
    pub fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    /// Take everything written so far
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state.lock().written)
    }

    /// Written data frames, skipping single control bytes
    pub fn written_frames(&self) -> Vec<Vec<u8>> {
        self.written().into_iter().filter(|w| w.len() > 1).collect()
    }

    /// Limit how many bytes one read returns
    pub fn set_read_chunk(&self, chunk: Option<usize>) {
        self.state.lock().read_chunk = chunk;
    }

    /// Fail the next `count` open attempts
    pub fn fail_opens(&self, count: u32) {
        self.state.lock().fail_opens = count;
    }

    /// Fail the next read as if the stick was unplugged
    pub fn disconnect(&self) {
        self.state.lock().fail_next_read = true;
        self.data_ready.notify_one();
    }

    /// Fail the next write
    pub fn fail_next_write(&self) {
        self.state.lock().fail_next_write = true;
    }

    /// Successful opens so far
    pub fn open_count(&self) -> u32 {
        self.state.lock().opens
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_opens > 0 {
            state.fail_opens -= 1;
            return Err(DriverError::PortOpenFailed {
                port: "mock".to_string(),
                reason: "simulated open failure".to_string(),
            });
        }
        state.open = true;
        state.opens += 1;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.state.lock().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state.lock().open
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut state = self.state.lock();
                if state.fail_next_read {
                    state.fail_next_read = false;
                    state.open = false;
                    return Err(DriverError::ReadError("simulated read failure".to_string()));
                }
                if !state.open {
                    return Err(DriverError::Disconnected);
                }
                if !state.inbound.is_empty() {
                    let limit = state.read_chunk.unwrap_or(buf.len()).min(buf.len());
                    let n = limit.min(state.inbound.len());
                    for (slot, byte) in buf.iter_mut().zip(state.inbound.drain(..n)) {
                        *slot = byte;
                    }
                    return Ok(n);
                }
            }

            if tokio::time::timeout_at(deadline, self.data_ready.notified())
                .await
                .is_err()
            {
                return Ok(0);
            }
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if state.fail_next_write {
            state.fail_next_write = false;
            state.open = false;
            return Err(DriverError::WriteError("simulated write failure".to_string()));
        }
        if !state.open {
            return Err(DriverError::Disconnected);
        }
        state.written.push(data.to_vec());
        Ok(())
    }

    fn name(&self) -> &str {
        "MockTransport"
    }
}

// ============================================================================
// Controller-side frames
// ============================================================================

/// Request frame from the controller
pub fn request_frame(function: FunctionId, args: &[u8]) -> Vec<u8> {
    Frame::new(Direction::Request, function.as_u8(), args.to_vec()).to_bytes()
}

/// Response frame from the controller
pub fn response_frame(function: FunctionId, args: &[u8]) -> Vec<u8> {
    Frame::new(Direction::Response, function.as_u8(), args.to_vec()).to_bytes()
}

/// Application command received from `node_id`
pub fn application_command(node_id: u8, command: &[u8]) -> Vec<u8> {
    let mut args = vec![0x00, node_id, command.len() as u8];
    args.extend_from_slice(command);
    request_frame(FunctionId::ApplicationCommandHandler, &args)
}

/// Node information frame `[basic][generic][specific][classes...]` from `node_id`
pub fn node_info_update(node_id: u8, info: &[u8]) -> Vec<u8> {
    let mut args = vec![update_status::NODE_INFO_RECEIVED, node_id, info.len() as u8];
    args.extend_from_slice(info);
    request_frame(FunctionId::ApplicationUpdate, &args)
}

/// Transmission callback for a send-data job
pub fn send_data_callback(callback_id: u8, status: u8) -> Vec<u8> {
    callback_frame(FunctionId::SendData, callback_id, status)
}

/// `[callback id][status]` callback for a controller request
pub fn callback_frame(function: FunctionId, callback_id: u8, status: u8) -> Vec<u8> {
    request_frame(function, &[callback_id, status])
}

/// Node protocol info response for a listening or sleeping node
pub fn protocol_info_response(listening: bool, generic: u8, specific: u8) -> Vec<u8> {
    let capability = if listening { 0x80 } else { 0x00 };
    response_frame(
        FunctionId::GetNodeProtocolInfo,
        &[capability, 0x00, 0x00, 0x04, generic, specific],
    )
}

/// Init data response listing `nodes`
pub fn init_data_response(nodes: &[u8]) -> Vec<u8> {
    let mut mask = [0u8; 29];
    for &node in nodes {
        let bit = usize::from(node.saturating_sub(1));
        if let Some(byte) = mask.get_mut(bit / 8) {
            *byte |= 1 << (bit % 8);
        }
    }
    let mut args = vec![0x05, 0x08, mask.len() as u8];
    args.extend_from_slice(&mask);
    response_frame(FunctionId::GetInitData, &args)
}

// ============================================================================
// Report recording
// ============================================================================

/// Report captured by [`RecordingHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    /// Basic value
    Basic {
        /// Reporting node
        node_id: u8,
        /// Reported value
        value: u8,
    },
    /// Basic value of one instance
    BasicInstance {
        /// Reporting node
        node_id: u8,
        /// Instance (1-based)
        instance: u8,
        /// Reported value
        value: u8,
    },
    /// Binary sensor
    SensorBinary {
        /// Reporting node
        node_id: u8,
        /// Reported value
        value: u8,
    },
    /// Multilevel sensor
    SensorMultilevel {
        /// Reporting node
        node_id: u8,
        /// Sensor type
        sensor_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Multilevel sensor of one instance
    SensorMultilevelInstance {
        /// Reporting node
        node_id: u8,
        /// Instance (1-based)
        instance: u8,
        /// Sensor type
        sensor_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Battery level
    Battery {
        /// Reporting node
        node_id: u8,
        /// Level
        level: u8,
    },
    /// Meter reading
    Meter {
        /// Reporting node
        node_id: u8,
        /// Meter type
        meter_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Thermostat setpoint
    ThermostatSetpoint {
        /// Reporting node
        node_id: u8,
        /// Setpoint type
        setpoint_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Thermostat mode
    ThermostatMode {
        /// Reporting node
        node_id: u8,
        /// Mode
        mode: u8,
    },
    /// Thermostat operating state
    ThermostatOperatingState {
        /// Reporting node
        node_id: u8,
        /// State
        state: u8,
    },
    /// Thermostat fan mode
    ThermostatFanMode {
        /// Reporting node
        node_id: u8,
        /// Mode
        mode: u8,
    },
    /// Configuration parameter
    Configuration {
        /// Reporting node
        node_id: u8,
        /// Parameter number
        parameter: u8,
        /// Reported value
        value: i32,
    },
}

/// Report handler that records every callback
#[derive(Debug, Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<ReportEvent>>,
}

impl RecordingHandler {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Recorded reports in arrival order
    pub fn events(&self) -> Vec<ReportEvent> {
        self.events.lock().clone()
    }

    fn record(&self, event: ReportEvent) {
        self.events.lock().push(event);
    }
}

impl ReportHandler for RecordingHandler {
    fn basic_report(&self, node_id: u8, value: u8) {
        self.record(ReportEvent::Basic { node_id, value });
    }

    fn sensor_binary_report(&self, node_id: u8, value: u8) {
        self.record(ReportEvent::SensorBinary { node_id, value });
    }

    fn sensor_multilevel_report(&self, node_id: u8, sensor_type: u8, reading: ScaledValue) {
        self.record(ReportEvent::SensorMultilevel {
            node_id,
            sensor_type,
            reading,
        });
    }

    fn battery_report(&self, node_id: u8, level: u8) {
        self.record(ReportEvent::Battery { node_id, level });
    }

    fn meter_report(&self, node_id: u8, meter_type: u8, reading: ScaledValue) {
        self.record(ReportEvent::Meter {
            node_id,
            meter_type,
            reading,
        });
    }

    fn thermostat_setpoint_report(&self, node_id: u8, setpoint_type: u8, reading: ScaledValue) {
        self.record(ReportEvent::ThermostatSetpoint {
            node_id,
            setpoint_type,
            reading,
        });
    }

    fn thermostat_mode_report(&self, node_id: u8, mode: u8) {
        self.record(ReportEvent::ThermostatMode { node_id, mode });
    }

    fn thermostat_operating_state_report(&self, node_id: u8, state: u8) {
        self.record(ReportEvent::ThermostatOperatingState { node_id, state });
    }

    fn thermostat_fan_mode_report(&self, node_id: u8, mode: u8) {
        self.record(ReportEvent::ThermostatFanMode { node_id, mode });
    }

    fn configuration_report(&self, node_id: u8, parameter: u8, value: i32) {
        self.record(ReportEvent::Configuration {
            node_id,
            parameter,
            value,
        });
    }

    fn basic_instance_report(&self, node_id: u8, instance: u8, value: u8) {
        self.record(ReportEvent::BasicInstance {
            node_id,
            instance,
            value,
        });
    }

    fn sensor_multilevel_instance_report(
        &self,
        node_id: u8,
        instance: u8,
        sensor_type: u8,
        reading: ScaledValue,
    ) {
        self.record(ReportEvent::SensorMultilevelInstance {
            node_id,
            instance,
            sensor_type,
            reading,
        });
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// Mock transport, recording handler and a test-friendly configuration
pub struct TestFixture {
    /// Shared mock transport
    pub transport: MockTransport,
    /// Recorded reports
    pub handler: Arc<RecordingHandler>,
    /// Driver configuration
    pub config: DriverConfig,
}

impl TestFixture {
    /// Fixture with discovery and reconnection disabled
    pub fn new() -> Self {
        Self::with_config(
            DriverConfigBuilder::new()
                .discover_on_start(false)
                .auto_reconnect(false)
                .build(),
        )
    }

    /// Fixture with a custom configuration
    pub fn with_config(config: DriverConfig) -> Self {
        Self {
            transport: MockTransport::new(),
            handler: Arc::new(RecordingHandler::new()),
            config,
        }
    }

    /// Build an engine over a clone of the transport
    pub fn engine(&self) -> (ProtocolEngine<MockTransport>, DriverHandle) {
        ProtocolEngine::new(self.transport.clone(), &self.config, self.handler.clone())
    }

    /// Build an engine and open its transport
    pub async fn start(&self) -> Result<(ProtocolEngine<MockTransport>, DriverHandle)> {
        let (mut engine, handle) = self.engine();
        engine.start().await?;
        Ok((engine, handle))
    }
}

impl Default for TestFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::decode;

    #[tokio::test(start_paused = true)]
    async fn test_mock_read_times_out() {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();

        let mut buf = [0u8; 8];
        let n = mock.read(&mut buf, Duration::from_millis(50)).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_mock_read_chunks() {
        let mut mock = MockTransport::new();
        mock.open().await.unwrap();
        mock.set_read_chunk(Some(2));
        mock.push_inbound(&[1, 2, 3]);

        let mut buf = [0u8; 8];
        assert_eq!(mock.read(&mut buf, Duration::from_millis(10)).await.unwrap(), 2);
        assert_eq!(&buf[..2], &[1, 2]);
        assert_eq!(mock.read(&mut buf, Duration::from_millis(10)).await.unwrap(), 1);
        assert_eq!(buf[0], 3);
    }

    #[tokio::test]
    async fn test_mock_failures() {
        let mut mock = MockTransport::new();
        mock.fail_opens(1);
        assert!(mock.open().await.is_err());
        mock.open().await.unwrap();
        assert_eq!(mock.open_count(), 1);

        mock.disconnect();
        let mut buf = [0u8; 8];
        let err = mock.read(&mut buf, Duration::from_millis(10)).await.unwrap_err();
        assert!(err.is_transport_error());
        assert!(!mock.is_open());
        assert!(mock.write(&[0x06]).await.is_err());
    }

    #[test]
    fn test_frame_builders_decode() {
        let frame = decode(&application_command(5, &[0x80, 0x03, 0x40])).unwrap();
        assert_eq!(frame.function_id(), Some(FunctionId::ApplicationCommandHandler));
        assert_eq!(&frame.args[..], &[0x00, 5, 3, 0x80, 0x03, 0x40]);

        let frame = decode(&init_data_response(&[1, 9])).unwrap();
        assert_eq!(frame.args[3], 0b0000_0001);
        assert_eq!(frame.args[4], 0b0000_0001);
    }
}
