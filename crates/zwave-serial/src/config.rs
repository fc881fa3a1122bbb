//! Configuration types for the controller driver
//!
//! This module provides configuration structures for the serial transport,
//! the protocol engine's timing and retry behaviour, and reconnection.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{DriverError, Result};

/// Start-of-frame marker
pub const SOF: u8 = 0x01;

/// Acknowledgement control byte
pub const ACK: u8 = 0x06;

/// Negative acknowledgement control byte
pub const NAK: u8 = 0x15;

/// Cancel control byte (sent by the controller on collision)
pub const CAN: u8 = 0x18;

/// Largest value the length byte can carry
pub const MAX_FRAME_LEN: usize = u8::MAX as usize;

/// Largest function identifier + arguments run that fits in one frame
/// (the length byte also covers the direction byte)
pub const MAX_FRAME_PAYLOAD: usize = MAX_FRAME_LEN - 1;

/// Endpoint identifier addressing every node
pub const BROADCAST_NODE_ID: u8 = 0xFF;

/// Highest node identifier a controller can assign
pub const MAX_NODE_ID: u8 = 232;

/// Number of association groups tracked per node
pub const ASSOCIATION_GROUPS: u8 = 4;

/// Size of the controller memory snapshot buffer
pub const MEMORY_SNAPSHOT_SIZE: usize = 16 * 1024;

/// Default baud rate for controller sticks
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default time to wait for an ACK after transmitting
pub const DEFAULT_ACK_TIMEOUT_MS: u64 = 1600;

/// Default time to wait for a response or callback after the ACK
pub const DEFAULT_CALLBACK_TIMEOUT_MS: u64 = 10_000;

/// Default number of transmissions before a job is dropped
pub const DEFAULT_RETRY_LIMIT: u32 = 3;

/// Default bound on a single transport read
pub const DEFAULT_READ_TIMEOUT_MS: u64 = 100;

/// Default correlation window for an intent
pub const DEFAULT_INTENT_TIMEOUT_MS: u64 = 5000;

/// Default interval between polling rounds
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Main configuration for the driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DriverConfig {
    /// Serial transport settings
    #[serde(default)]
    pub transport: TransportConfig,

    /// Protocol engine timing and retry settings
    #[serde(default)]
    pub protocol: ProtocolConfig,

    /// Reconnection settings
    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl DriverConfig {
    /// Check the configuration for values the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.protocol.retry_limit == 0 {
            return Err(DriverError::InvalidConfig(
                "retry_limit must be at least 1".to_string(),
            ));
        }
        if self.protocol.read_timeout.is_zero() {
            return Err(DriverError::InvalidConfig(
                "read_timeout must be non-zero".to_string(),
            ));
        }
        if self.protocol.ack_timeout.is_zero() || self.protocol.callback_timeout.is_zero() {
            return Err(DriverError::InvalidConfig(
                "job timeouts must be non-zero".to_string(),
            ));
        }
        if self.protocol.poll_interval.is_zero() {
            return Err(DriverError::InvalidConfig(
                "poll_interval must be non-zero".to_string(),
            ));
        }
        if self.reconnect.initial_delay > self.reconnect.max_delay {
            return Err(DriverError::InvalidConfig(
                "reconnect initial_delay exceeds max_delay".to_string(),
            ));
        }
        Ok(())
    }
}

/// Serial port settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path to serial port (e.g., /dev/ttyACM0, COM3)
    pub port: PathBuf,

    /// Baud rate (default: 115200)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: PathBuf::from("/dev/ttyACM0"),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

/// Protocol engine timing and retry behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Time to wait for the controller's ACK
    #[serde(with = "humantime_serde", default = "default_ack_timeout")]
    pub ack_timeout: Duration,

    /// Time to wait for a response or callback frame once ACKed
    #[serde(with = "humantime_serde", default = "default_callback_timeout")]
    pub callback_timeout: Duration,

    /// Transmissions allowed per job before it is dropped
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Bound on one transport read, so timers are serviced without traffic
    #[serde(with = "humantime_serde", default = "default_read_timeout")]
    pub read_timeout: Duration,

    /// Correlation window for an intent
    #[serde(with = "humantime_serde", default = "default_intent_timeout")]
    pub intent_timeout: Duration,

    /// Times an expired intent's query is reissued (0 = silent expiry)
    #[serde(default)]
    pub intent_retries: u8,

    /// Query version, home id and node list when the engine starts
    #[serde(default = "default_discover_on_start")]
    pub discover_on_start: bool,

    /// Time between basic-value polls of listening nodes, once enabled
    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,
}

fn default_ack_timeout() -> Duration {
    Duration::from_millis(DEFAULT_ACK_TIMEOUT_MS)
}

fn default_callback_timeout() -> Duration {
    Duration::from_millis(DEFAULT_CALLBACK_TIMEOUT_MS)
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_read_timeout() -> Duration {
    Duration::from_millis(DEFAULT_READ_TIMEOUT_MS)
}

fn default_intent_timeout() -> Duration {
    Duration::from_millis(DEFAULT_INTENT_TIMEOUT_MS)
}

fn default_discover_on_start() -> bool {
    true
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS)
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            ack_timeout: default_ack_timeout(),
            callback_timeout: default_callback_timeout(),
            retry_limit: DEFAULT_RETRY_LIMIT,
            read_timeout: default_read_timeout(),
            intent_timeout: default_intent_timeout(),
            intent_retries: 0,
            discover_on_start: true,
            poll_interval: default_poll_interval(),
        }
    }
}

/// Reconnection behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// Enable automatic reconnection
    #[serde(default = "default_auto_reconnect")]
    pub enabled: bool,

    /// Initial delay before first reconnection attempt
    #[serde(with = "humantime_serde", default = "default_initial_delay")]
    pub initial_delay: Duration,

    /// Maximum delay between reconnection attempts
    #[serde(with = "humantime_serde", default = "default_max_delay")]
    pub max_delay: Duration,

    /// Maximum number of reconnection attempts (0 = infinite)
    #[serde(default)]
    pub max_attempts: u32,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl ReconnectConfig {
    /// Backoff before the given (1-based) reconnection attempt
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << shift)
            .min(self.max_delay)
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            max_attempts: 0, // Infinite
        }
    }
}

/// Builder for DriverConfig
#[derive(Debug, Default)]
pub struct DriverConfigBuilder {
    config: DriverConfig,
}

impl DriverConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set serial port path
    pub fn serial_port(mut self, port: impl Into<PathBuf>) -> Self {
        self.config.transport.port = port.into();
        self
    }

    /// Set baud rate
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.transport.baud_rate = baud_rate;
        self
    }

    /// Set the ACK wait
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.ack_timeout = timeout;
        self
    }

    /// Set the response/callback wait
    pub fn callback_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.callback_timeout = timeout;
        self
    }

    /// Set the retry limit (at least one transmission is always made)
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.config.protocol.retry_limit = limit.max(1);
        self
    }

    /// Set the bounded read timeout
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.read_timeout = timeout;
        self
    }

    /// Set the intent correlation window
    pub fn intent_timeout(mut self, timeout: Duration) -> Self {
        self.config.protocol.intent_timeout = timeout;
        self
    }

    /// Set how often an expired intent's query is reissued
    pub fn intent_retries(mut self, retries: u8) -> Self {
        self.config.protocol.intent_retries = retries;
        self
    }

    /// Enable or disable discovery when the engine starts
    pub fn discover_on_start(mut self, enabled: bool) -> Self {
        self.config.protocol.discover_on_start = enabled;
        self
    }

    /// Set the polling interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.protocol.poll_interval = interval;
        self
    }

    /// Enable or disable auto-reconnect
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.reconnect.enabled = enabled;
        self
    }

    /// Limit reconnection attempts (0 = infinite)
    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.config.reconnect.max_attempts = attempts;
        self
    }

    /// Build the configuration
    pub fn build(self) -> DriverConfig {
        self.config
    }
}

// Custom serde module for Duration with humantime
mod humantime_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let s = humantime::format_duration(*duration).to_string();
        serializer.serialize_str(&s)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
