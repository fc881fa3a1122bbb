//! Command class payloads
//!
//! Encodes the application-layer commands the driver issues and decodes the
//! reports nodes send back through application-command frames. Decoding
//! stops at the numeric fields; interpreting them is up to the
//! [`ReportHandler`](crate::handler::ReportHandler).

use crate::error::{DriverError, Result};

/// Command class identifiers
pub mod class {
    /// Basic value set/get/report
    pub const BASIC: u8 = 0x20;
    /// On/off switch
    pub const SWITCH_BINARY: u8 = 0x25;
    /// Dimmer-style switch
    pub const SWITCH_MULTILEVEL: u8 = 0x26;
    /// On/off sensor
    pub const SENSOR_BINARY: u8 = 0x30;
    /// Scaled sensor readings
    pub const SENSOR_MULTILEVEL: u8 = 0x31;
    /// Energy and utility meters
    pub const METER: u8 = 0x32;
    /// Thermostat mode
    pub const THERMOSTAT_MODE: u8 = 0x40;
    /// Thermostat operating state
    pub const THERMOSTAT_OPERATING_STATE: u8 = 0x42;
    /// Thermostat setpoints
    pub const THERMOSTAT_SETPOINT: u8 = 0x43;
    /// Thermostat fan mode
    pub const THERMOSTAT_FAN_MODE: u8 = 0x44;
    /// Instance counts and per-instance encapsulation
    pub const MULTI_INSTANCE: u8 = 0x60;
    /// Device configuration parameters
    pub const CONFIGURATION: u8 = 0x70;
    /// Manufacturer and product identifiers
    pub const MANUFACTURER_SPECIFIC: u8 = 0x72;
    /// Battery level
    pub const BATTERY: u8 = 0x80;
    /// Wake-up interval and notifications of sleeping nodes
    pub const WAKE_UP: u8 = 0x84;
    /// Association groups
    pub const ASSOCIATION: u8 = 0x85;
    /// Library, firmware and command class versions
    pub const VERSION: u8 = 0x86;
    /// Separates supported from controlled classes in a node information frame
    pub const MARK: u8 = 0xEF;
}

/// Set/Get/Report commands shared by the simple value classes
/// (basic, binary/multilevel switch, thermostat mode, fan mode, ...)
pub mod value_cmd {
    /// Set the value
    pub const SET: u8 = 0x01;
    /// Request a report
    pub const GET: u8 = 0x02;
    /// Current value
    pub const REPORT: u8 = 0x03;
}

/// Multilevel sensor commands
pub mod sensor_multilevel {
    /// Request a reading
    pub const GET: u8 = 0x04;
    /// Reading
    pub const REPORT: u8 = 0x05;
}

/// Meter commands
pub mod meter {
    /// Request a reading
    pub const GET: u8 = 0x01;
    /// Reading
    pub const REPORT: u8 = 0x02;
}

/// Multi-instance commands
pub mod multi_instance {
    /// Request the instance count of a class
    pub const GET: u8 = 0x04;
    /// Instance count of a class
    pub const REPORT: u8 = 0x05;
    /// Command addressed to or sent from one instance
    pub const CMD_ENCAP: u8 = 0x06;
    /// Highest addressable instance
    pub const MAX_INSTANCE: u8 = 0x7F;
}

/// Configuration commands
pub mod configuration {
    /// Set a parameter
    pub const SET: u8 = 0x04;
    /// Request a parameter
    pub const GET: u8 = 0x05;
    /// Parameter value
    pub const REPORT: u8 = 0x06;
}

/// Manufacturer-specific commands
pub mod manufacturer_specific {
    /// Request the identifiers
    pub const GET: u8 = 0x04;
    /// Identifiers
    pub const REPORT: u8 = 0x05;
}

/// Wake-up commands
pub mod wake_up {
    /// Set the interval and notification target
    pub const INTERVAL_SET: u8 = 0x04;
    /// Request the interval
    pub const INTERVAL_GET: u8 = 0x05;
    /// Interval and notification target
    pub const INTERVAL_REPORT: u8 = 0x06;
    /// The node is awake
    pub const NOTIFICATION: u8 = 0x07;
    /// The node may go back to sleep
    pub const NO_MORE_INFORMATION: u8 = 0x08;
}

/// Association commands
pub mod association {
    /// Add members to a group
    pub const SET: u8 = 0x01;
    /// Request the members of a group
    pub const GET: u8 = 0x02;
    /// Members of a group
    pub const REPORT: u8 = 0x03;
    /// Remove members from a group
    pub const REMOVE: u8 = 0x04;
}

/// Version commands
pub mod version {
    /// Request library and firmware versions
    pub const GET: u8 = 0x11;
    /// Library and firmware versions
    pub const REPORT: u8 = 0x12;
    /// Request the version of one class
    pub const COMMAND_CLASS_GET: u8 = 0x13;
    /// Version of one class
    pub const COMMAND_CLASS_REPORT: u8 = 0x14;
}

/// Fixed-point value as carried by sensor, meter and setpoint commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaledValue {
    /// Raw signed integer
    pub value: i32,
    /// Decimal places (value / 10^precision)
    pub precision: u8,
    /// Class-specific unit selector
    pub scale: u8,
}

impl ScaledValue {
    /// Create a value
    pub fn new(value: i32, precision: u8, scale: u8) -> Self {
        Self {
            value,
            precision,
            scale,
        }
    }

    /// Value as a float, applying the precision
    pub fn as_f64(&self) -> f64 {
        f64::from(self.value) / 10f64.powi(i32::from(self.precision))
    }

    /// Decode `[precision|scale|size][value...]`
    ///
    /// Returns the value and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Option<(Self, usize)> {
        let (&pss, rest) = bytes.split_first()?;
        let precision = pss >> 5;
        let scale = (pss >> 3) & 0x03;
        let size = usize::from(pss & 0x07);

        let value = match (size, rest) {
            (1, [a, ..]) => i32::from(*a as i8),
            (2, [a, b, ..]) => i32::from(i16::from_be_bytes([*a, *b])),
            (4, [a, b, c, d, ..]) => i32::from_be_bytes([*a, *b, *c, *d]),
            _ => return None,
        };
        Some((Self::new(value, precision, scale), 1 + size))
    }

    /// Encode using the smallest size that holds the value
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.precision > 7 || self.scale > 3 {
            return Err(DriverError::InvalidArgument(format!(
                "precision {} / scale {} out of range",
                self.precision, self.scale
            )));
        }
        let raw: Vec<u8> = if let Ok(v) = i8::try_from(self.value) {
            v.to_be_bytes().to_vec()
        } else if let Ok(v) = i16::try_from(self.value) {
            v.to_be_bytes().to_vec()
        } else {
            self.value.to_be_bytes().to_vec()
        };

        let pss = (self.precision << 5) | (self.scale << 3) | raw.len() as u8;
        let mut out = Vec::with_capacity(raw.len() + 1);
        out.push(pss);
        out.extend_from_slice(&raw);
        Ok(out)
    }
}

/// Report decoded from an application-command frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandReport {
    /// Basic, binary switch or multilevel switch state
    Basic {
        /// Class that carried the report
        class: u8,
        /// Reported value
        value: u8,
    },
    /// Binary sensor state
    SensorBinary {
        /// 0 idle, 0xFF triggered
        value: u8,
    },
    /// Multilevel sensor reading
    SensorMultilevel {
        /// Sensor type (temperature, luminance, ...)
        sensor_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Meter reading
    Meter {
        /// Meter type (electric, gas, water)
        meter_type: u8,
        /// Reading
        reading: ScaledValue,
    },
    /// Battery level in percent (0xFF = low battery warning)
    Battery {
        /// Level
        level: u8,
    },
    /// Thermostat setpoint
    ThermostatSetpoint {
        /// Setpoint type (heating, cooling, ...)
        setpoint_type: u8,
        /// Setpoint
        reading: ScaledValue,
    },
    /// Thermostat mode
    ThermostatMode {
        /// Mode
        mode: u8,
    },
    /// Thermostat operating state
    ThermostatOperatingState {
        /// State
        state: u8,
    },
    /// Thermostat fan mode
    ThermostatFanMode {
        /// Fan mode
        mode: u8,
    },
    /// Sleeping node is awake and listening
    WakeUpNotification,
    /// Configured wake-up interval
    WakeUpInterval {
        /// Interval in seconds
        seconds: u32,
        /// Node notified on wake-up
        target: u8,
    },
    /// Manufacturer and product identifiers
    ManufacturerSpecific {
        /// Manufacturer
        manufacturer_id: u16,
        /// Product type
        product_type: u16,
        /// Product
        product_id: u16,
    },
    /// Library and firmware versions
    Version {
        /// Library type
        library_type: u8,
        /// Protocol version (major, minor)
        protocol: (u8, u8),
        /// Application version (major, minor)
        application: (u8, u8),
    },
    /// Version of one command class
    CommandClassVersion {
        /// Command class
        class: u8,
        /// Its version
        version: u8,
    },
    /// Members of an association group
    Association {
        /// Group
        group: u8,
        /// Group capacity
        max_nodes: u8,
        /// Member node ids
        members: Vec<u8>,
    },
    /// Instance count for one command class
    MultiInstance {
        /// Command class
        class: u8,
        /// Addressable instances
        instances: u8,
    },
    /// Configuration parameter value
    Configuration {
        /// Parameter number
        parameter: u8,
        /// Signed value
        value: i32,
    },
    /// Report sent from one instance of a multi-instance node
    Encapsulated {
        /// Instance (1-based)
        instance: u8,
        /// Report the instance sent
        report: Box<CommandReport>,
    },
}

/// Decode `[class][command][params...]` from an application-command frame
///
/// Returns `None` for commands the driver does not track.
pub fn decode_command(bytes: &[u8]) -> Option<CommandReport> {
    let (&cc, rest) = bytes.split_first()?;
    let (&cmd, params) = rest.split_first()?;

    let report = match (cc, cmd) {
        (class::BASIC | class::SWITCH_BINARY | class::SWITCH_MULTILEVEL, value_cmd::REPORT) => {
            CommandReport::Basic {
                class: cc,
                value: *params.first()?,
            }
        }
        (class::SENSOR_BINARY, value_cmd::REPORT) => CommandReport::SensorBinary {
            value: *params.first()?,
        },
        (class::SENSOR_MULTILEVEL, sensor_multilevel::REPORT) => {
            let (&sensor_type, value) = params.split_first()?;
            CommandReport::SensorMultilevel {
                sensor_type,
                reading: ScaledValue::decode(value)?.0,
            }
        }
        (class::METER, meter::REPORT) => {
            let (&meter_type, value) = params.split_first()?;
            CommandReport::Meter {
                meter_type: meter_type & 0x1F,
                reading: ScaledValue::decode(value)?.0,
            }
        }
        (class::BATTERY, value_cmd::REPORT) => CommandReport::Battery {
            level: *params.first()?,
        },
        (class::THERMOSTAT_SETPOINT, value_cmd::REPORT) => {
            let (&setpoint_type, value) = params.split_first()?;
            CommandReport::ThermostatSetpoint {
                setpoint_type: setpoint_type & 0x0F,
                reading: ScaledValue::decode(value)?.0,
            }
        }
        (class::THERMOSTAT_MODE, value_cmd::REPORT) => CommandReport::ThermostatMode {
            mode: *params.first()? & 0x1F,
        },
        (class::THERMOSTAT_OPERATING_STATE, value_cmd::REPORT) => {
            CommandReport::ThermostatOperatingState {
                state: *params.first()? & 0x0F,
            }
        }
        (class::THERMOSTAT_FAN_MODE, value_cmd::REPORT) => CommandReport::ThermostatFanMode {
            mode: *params.first()? & 0x0F,
        },
        (class::WAKE_UP, wake_up::NOTIFICATION) => CommandReport::WakeUpNotification,
        (class::WAKE_UP, wake_up::INTERVAL_REPORT) => match params {
            [a, b, c, target, ..] => CommandReport::WakeUpInterval {
                seconds: u32::from_be_bytes([0, *a, *b, *c]),
                target: *target,
            },
            _ => return None,
        },
        (class::MANUFACTURER_SPECIFIC, manufacturer_specific::REPORT) => match params {
            [m1, m2, t1, t2, p1, p2, ..] => CommandReport::ManufacturerSpecific {
                manufacturer_id: u16::from_be_bytes([*m1, *m2]),
                product_type: u16::from_be_bytes([*t1, *t2]),
                product_id: u16::from_be_bytes([*p1, *p2]),
            },
            _ => return None,
        },
        (class::VERSION, version::REPORT) => match params {
            [lib, pmaj, pmin, amaj, amin, ..] => CommandReport::Version {
                library_type: *lib,
                protocol: (*pmaj, *pmin),
                application: (*amaj, *amin),
            },
            _ => return None,
        },
        (class::VERSION, version::COMMAND_CLASS_REPORT) => match params {
            [class, version, ..] => CommandReport::CommandClassVersion {
                class: *class,
                version: *version,
            },
            _ => return None,
        },
        (class::ASSOCIATION, association::REPORT) => match params {
            [group, max_nodes, _follow, members @ ..] => CommandReport::Association {
                group: *group,
                max_nodes: *max_nodes,
                members: members.to_vec(),
            },
            _ => return None,
        },
        (class::MULTI_INSTANCE, multi_instance::REPORT) => match params {
            [class, instances, ..] => CommandReport::MultiInstance {
                class: *class,
                instances: *instances & multi_instance::MAX_INSTANCE,
            },
            _ => return None,
        },
        (class::MULTI_INSTANCE, multi_instance::CMD_ENCAP) => {
            let (&instance, inner) = params.split_first()?;
            CommandReport::Encapsulated {
                instance: instance & multi_instance::MAX_INSTANCE,
                report: Box::new(decode_command(inner)?),
            }
        }
        (class::CONFIGURATION, configuration::REPORT) => match params {
            [parameter, size, value @ ..] => CommandReport::Configuration {
                parameter: *parameter,
                value: decode_signed(*size & 0x07, value)?,
            },
            _ => return None,
        },
        _ => return None,
    };
    Some(report)
}

/// Signed big-endian value of 1, 2 or 4 bytes
fn decode_signed(size: u8, bytes: &[u8]) -> Option<i32> {
    match (size, bytes) {
        (1, [a, ..]) => Some(i32::from(*a as i8)),
        (2, [a, b, ..]) => Some(i32::from(i16::from_be_bytes([*a, *b]))),
        (4, [a, b, c, d, ..]) => Some(i32::from_be_bytes([*a, *b, *c, *d])),
        _ => None,
    }
}

/// `[class][SET][value]`
pub fn value_set(class: u8, value: u8) -> Vec<u8> {
    vec![class, value_cmd::SET, value]
}

/// `[class][GET]`
pub fn value_get(class: u8) -> Vec<u8> {
    vec![class, value_cmd::GET]
}

/// Multilevel sensor get
pub fn sensor_multilevel_get() -> Vec<u8> {
    vec![class::SENSOR_MULTILEVEL, sensor_multilevel::GET]
}

/// Meter get
pub fn meter_get() -> Vec<u8> {
    vec![class::METER, meter::GET]
}

/// Setpoint set for one setpoint type
pub fn thermostat_setpoint_set(setpoint_type: u8, value: ScaledValue) -> Result<Vec<u8>> {
    let mut out = vec![
        class::THERMOSTAT_SETPOINT,
        value_cmd::SET,
        setpoint_type & 0x0F,
    ];
    out.extend(value.encode()?);
    Ok(out)
}

/// Setpoint get for one setpoint type
pub fn thermostat_setpoint_get(setpoint_type: u8) -> Vec<u8> {
    vec![class::THERMOSTAT_SETPOINT, value_cmd::GET, setpoint_type & 0x0F]
}

/// Wake-up interval set; the interval is 24 bits on the wire
pub fn wake_up_interval_set(seconds: u32, target: u8) -> Result<Vec<u8>> {
    if seconds > 0x00FF_FFFF {
        return Err(DriverError::InvalidArgument(format!(
            "wake-up interval {} exceeds 24 bits",
            seconds
        )));
    }
    let [_, a, b, c] = seconds.to_be_bytes();
    Ok(vec![class::WAKE_UP, wake_up::INTERVAL_SET, a, b, c, target])
}

/// Tells a sleeping node it may power down again
pub fn wake_up_no_more_information() -> Vec<u8> {
    vec![class::WAKE_UP, wake_up::NO_MORE_INFORMATION]
}

/// Association set/remove for one group
pub fn association_change(command: u8, group: u8, members: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(members.len() + 3);
    out.extend_from_slice(&[class::ASSOCIATION, command, group]);
    out.extend_from_slice(members);
    out
}

/// Association get for one group
pub fn association_get(group: u8) -> Vec<u8> {
    vec![class::ASSOCIATION, association::GET, group]
}

/// Manufacturer-specific get
pub fn manufacturer_specific_get() -> Vec<u8> {
    vec![class::MANUFACTURER_SPECIFIC, manufacturer_specific::GET]
}

/// Library version get
pub fn version_get() -> Vec<u8> {
    vec![class::VERSION, version::GET]
}

/// Version of one command class
pub fn command_class_version_get(class: u8) -> Vec<u8> {
    vec![self::class::VERSION, version::COMMAND_CLASS_GET, class]
}

/// Instance count of one command class
pub fn multi_instance_get(class: u8) -> Vec<u8> {
    vec![self::class::MULTI_INSTANCE, multi_instance::GET, class]
}

/// Address `command` to one instance of a multi-instance node
pub fn multi_instance_encap(instance: u8, command: &[u8]) -> Result<Vec<u8>> {
    if instance == 0 || instance > multi_instance::MAX_INSTANCE {
        return Err(DriverError::InvalidArgument(format!(
            "instance {} outside 1-{}",
            instance,
            multi_instance::MAX_INSTANCE
        )));
    }
    let mut out = Vec::with_capacity(command.len() + 3);
    out.extend_from_slice(&[class::MULTI_INSTANCE, multi_instance::CMD_ENCAP, instance]);
    out.extend_from_slice(command);
    Ok(out)
}

/// Configuration set of a 1, 2 or 4 byte parameter
pub fn configuration_set(parameter: u8, value: i32, size: u8) -> Result<Vec<u8>> {
    let raw = match size {
        1 => i8::try_from(value).map(|v| v.to_be_bytes().to_vec()),
        2 => i16::try_from(value).map(|v| v.to_be_bytes().to_vec()),
        4 => Ok(value.to_be_bytes().to_vec()),
        _ => {
            return Err(DriverError::InvalidArgument(format!(
                "configuration size {} not 1, 2 or 4",
                size
            )))
        }
    }
    .map_err(|_| {
        DriverError::InvalidArgument(format!(
            "configuration value {} does not fit {} bytes",
            value, size
        ))
    })?;

    let mut out = vec![class::CONFIGURATION, configuration::SET, parameter, size];
    out.extend(raw);
    Ok(out)
}

/// Fan mode set (0 auto low, 1 on low, 2 auto high, 3 on high, ...)
pub fn thermostat_fan_mode_set(mode: u8) -> Vec<u8> {
    value_set(class::THERMOSTAT_FAN_MODE, mode & 0x0F)
}
