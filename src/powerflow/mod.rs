//! Power decomposition: one validated snapshot of where every watt comes
//! from and goes to, per unit and cumulated across units.

pub mod engine;

pub use engine::{cumulate, PowerflowEngine};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::devices::UnitIdentity;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct InverterFlow {
    /// Signed AC power; positive towards the grid side.
    pub power: f64,
    pub consumption: f64,
    pub production: f64,
    pub pv_production: f64,
    pub battery_production: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GridFlow {
    /// Signed meter sum; positive means delivery into the grid.
    pub power: f64,
    pub consumption: f64,
    pub delivery: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BatteryFlow {
    /// Signed battery sum; positive means charging.
    pub power: f64,
    pub charge: f64,
    pub discharge: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerFlow {
    pub house: f64,
    pub ev_charger: f64,
    pub inverter_consumption: f64,
    pub used_production: f64,
    pub used_pv_production: f64,
    pub used_battery_production: f64,
    pub total: f64,
}

/// One cycle's validated power decomposition. Immutable once computed;
/// superseded by the next cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Powerflow {
    pub unit: UnitIdentity,
    pub timestamp: DateTime<Utc>,
    pub inverter: InverterFlow,
    pub grid: GridFlow,
    pub battery: BatteryFlow,
    pub consumer: ConsumerFlow,
    /// Set when the PV production jumped implausibly against the previous
    /// cycle (sensor glitch guard). The value is still published.
    pub suspect: bool,
}
