//! Report callbacks
//!
//! The engine decodes application commands into numeric fields and forwards
//! them to a [`ReportHandler`]. All methods default to doing nothing, so an
//! implementation only overrides the reports it cares about.
//!
//! Handlers run on the engine task after the session lock has been
//! released; they must not block for long, since inbound traffic waits on
//! them.

use crate::command_class::{CommandReport, ScaledValue};

/// Callbacks for decoded node reports
pub trait ReportHandler: Send + Sync {
    /// Basic, binary switch or multilevel switch state
    fn basic_report(&self, _node_id: u8, _value: u8) {}

    /// Binary sensor state
    fn sensor_binary_report(&self, _node_id: u8, _value: u8) {}

    /// Multilevel sensor reading
    fn sensor_multilevel_report(&self, _node_id: u8, _sensor_type: u8, _reading: ScaledValue) {}

    /// Battery level in percent
    fn battery_report(&self, _node_id: u8, _level: u8) {}

    /// Meter reading
    fn meter_report(&self, _node_id: u8, _meter_type: u8, _reading: ScaledValue) {}

    /// Thermostat setpoint
    fn thermostat_setpoint_report(&self, _node_id: u8, _setpoint_type: u8, _reading: ScaledValue) {
    }

    /// Thermostat mode
    fn thermostat_mode_report(&self, _node_id: u8, _mode: u8) {}

    /// Thermostat operating state
    fn thermostat_operating_state_report(&self, _node_id: u8, _state: u8) {}

    /// Thermostat fan mode
    fn thermostat_fan_mode_report(&self, _node_id: u8, _mode: u8) {}

    /// Configuration parameter value
    fn configuration_report(&self, _node_id: u8, _parameter: u8, _value: i32) {}

    /// Basic state of one instance of a multi-instance node
    fn basic_instance_report(&self, node_id: u8, _instance: u8, value: u8) {
        self.basic_report(node_id, value)
    }

    /// Multilevel sensor reading from one instance of a multi-instance node
    fn sensor_multilevel_instance_report(
        &self,
        node_id: u8,
        _instance: u8,
        sensor_type: u8,
        reading: ScaledValue,
    ) {
        self.sensor_multilevel_report(node_id, sensor_type, reading)
    }
}

/// Handler that ignores every report
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ReportHandler for NoopHandler {}

/// Forward a decoded report to the matching callback
///
/// Reports the handler has no callback for (versions, associations, ...)
/// only update the registry; for those this returns `false`.
pub fn dispatch(handler: &dyn ReportHandler, node_id: u8, report: &CommandReport) -> bool {
    match report {
        CommandReport::Basic { value, .. } => handler.basic_report(node_id, *value),
        CommandReport::SensorBinary { value } => handler.sensor_binary_report(node_id, *value),
        CommandReport::SensorMultilevel {
            sensor_type,
            reading,
        } => handler.sensor_multilevel_report(node_id, *sensor_type, *reading),
        CommandReport::Battery { level } => handler.battery_report(node_id, *level),
        CommandReport::Meter {
            meter_type,
            reading,
        } => handler.meter_report(node_id, *meter_type, *reading),
        CommandReport::ThermostatSetpoint {
            setpoint_type,
            reading,
        } => handler.thermostat_setpoint_report(node_id, *setpoint_type, *reading),
        CommandReport::ThermostatMode { mode } => handler.thermostat_mode_report(node_id, *mode),
        CommandReport::ThermostatOperatingState { state } => {
            handler.thermostat_operating_state_report(node_id, *state)
        }
        CommandReport::ThermostatFanMode { mode } => {
            handler.thermostat_fan_mode_report(node_id, *mode)
        }
        CommandReport::Configuration { parameter, value } => {
            handler.configuration_report(node_id, *parameter, *value)
        }
        CommandReport::Encapsulated { instance, report } => match report.as_ref() {
            CommandReport::Basic { value, .. } => {
                handler.basic_instance_report(node_id, *instance, *value)
            }
            CommandReport::SensorMultilevel {
                sensor_type,
                reading,
            } => handler.sensor_multilevel_instance_report(
                node_id,
                *instance,
                *sensor_type,
                *reading,
            ),
            other => return dispatch(handler, node_id, other),
        },
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Battery(Mutex<Vec<(u8, u8)>>);

    impl ReportHandler for Battery {
        fn battery_report(&self, node_id: u8, level: u8) {
            self.0.lock().push((node_id, level));
        }
    }

    #[test]
    fn test_dispatch_reaches_overridden_callback() {
        let handler = Battery::default();
        assert!(dispatch(&handler, 4, &CommandReport::Battery { level: 87 }));
        assert!(dispatch(&handler, 4, &CommandReport::ThermostatMode { mode: 1 }));
        assert!(!dispatch(&handler, 4, &CommandReport::WakeUpNotification));
        assert_eq!(*handler.0.lock(), vec![(4, 87)]);
    }

    #[derive(Default)]
    struct Sensors {
        plain: Mutex<Vec<(u8, u8)>>,
        instanced: Mutex<Vec<(u8, u8, u8)>>,
    }

    impl ReportHandler for Sensors {
        fn sensor_multilevel_report(&self, node_id: u8, sensor_type: u8, _reading: ScaledValue) {
            self.plain.lock().push((node_id, sensor_type));
        }

        fn basic_instance_report(&self, node_id: u8, instance: u8, value: u8) {
            self.instanced.lock().push((node_id, instance, value));
        }
    }

    #[test]
    fn test_encapsulated_reports_carry_instance() {
        let handler = Sensors::default();
        let sensor = CommandReport::Encapsulated {
            instance: 2,
            report: Box::new(CommandReport::SensorMultilevel {
                sensor_type: 1,
                reading: ScaledValue::new(215, 1, 0),
            }),
        };
        let basic = CommandReport::Encapsulated {
            instance: 3,
            report: Box::new(CommandReport::Basic {
                class: 0x20,
                value: 0xFF,
            }),
        };
        let battery = CommandReport::Encapsulated {
            instance: 1,
            report: Box::new(CommandReport::WakeUpNotification),
        };

        assert!(dispatch(&handler, 9, &sensor));
        assert!(dispatch(&handler, 9, &basic));
        assert!(!dispatch(&handler, 9, &battery));
        // The default instance callback falls back to the plain one
        assert_eq!(*handler.plain.lock(), vec![(9, 1)]);
        assert_eq!(*handler.instanced.lock(), vec![(9, 3, 0xFF)]);
    }
}
