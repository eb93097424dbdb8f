//! Solar Inverter Modbus Bridge
//!
//! Polls one or more SunSpec inverter units over Modbus TCP, decodes their
//! register windows into typed snapshots, derives a validated powerflow
//! decomposition per cycle, and publishes everything to MQTT (with Home
//! Assistant discovery) and a local measurement store.

pub mod bus;
pub mod cli;
pub mod config;
pub mod devices;
pub mod modbus;
pub mod output;
pub mod powerflow;
pub mod registers;
pub mod services;
#[cfg(feature = "sqlite")]
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use bus::{BridgeEvent, EventBus, Subscriber, Topic};
pub use config::{Config, UnitConfig};
pub use devices::{
    BatteryData, DeviceReader, InverterData, MeterData, StorageControlData, UnitIdentity,
    UnitRole, UnitSnapshots,
};
pub use modbus::{ModbusClientTrait, ModbusTcpClient};
pub use powerflow::{cumulate, Powerflow, PowerflowEngine};
pub use services::{BridgeService, Scheduler};
pub use utils::error::BridgeError;

pub const VERSION: &str = "0.3.0";
