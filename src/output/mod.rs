pub mod discovery;
pub mod flatten;
pub mod mqtt;

pub use discovery::{battery_sensors, inverter_sensors, powerflow_sensors, ConfigPayload};
pub use flatten::flatten_fields;
pub use mqtt::{MqttPublisher, MqttSender};
