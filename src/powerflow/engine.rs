use chrono::Utc;
use log::{debug, warn};
use std::collections::BTreeMap;

use crate::devices::{BatteryData, MeterData, UnitIdentity, UnitSnapshots};
use crate::utils::error::BridgeError;

use super::{BatteryFlow, ConsumerFlow, GridFlow, InverterFlow, Powerflow};

/// Tolerance for floating point comparisons on watt values.
const EPSILON: f64 = 0.5;

/// A PV production that jumps from exactly zero to beyond this many watts
/// within one cycle is flagged as suspect.
const PV_JUMP_THRESHOLD: f64 = 100.0;

/// Computes one unit's power decomposition per cycle.
///
/// The previous cycle's pv_production is the engine's only cross-cycle
/// state, kept per instance so several units (or tests) never interfere.
pub struct PowerflowEngine {
    external_production: bool,
    last_pv_production: Option<f64>,
}

impl PowerflowEngine {
    pub fn new(external_production: bool) -> Self {
        Self {
            external_production,
            last_pv_production: None,
        }
    }

    /// Previous cycle's pv_production, if a cycle has completed yet.
    pub fn last_pv_production(&self) -> Option<f64> {
        self.last_pv_production
    }

    /// Derive a validated decomposition from one unit's snapshots and the
    /// externally metered EV charger load.
    pub fn from_devices(
        &mut self,
        snapshots: &UnitSnapshots,
        ev_load: f64,
    ) -> Result<Powerflow, BridgeError> {
        let inverter = &snapshots.inverter;

        let grid_power = grid_power(&snapshots.meters);
        let battery_power = battery_power(&snapshots.batteries);
        let battery_discharge = (-battery_power).max(0.0);

        let production = inverter.production();
        let consumption = inverter.consumption();

        // Share of AC output attributable to battery discharge instead of
        // PV input. Only meaningful while producing and discharging.
        let factor = if production > 0.0 && battery_discharge > 0.0 && inverter.dc_power > 0.0 {
            battery_discharge / inverter.dc_power
        } else {
            0.0
        };

        let battery_production = (production * factor).round().min(production);
        let pv_production = production - battery_production;

        let delivery = grid_power.max(0.0);
        let grid_consumption = (-grid_power).max(0.0);

        // An EV charger ramping up can briefly be metered before the grid
        // meter catches up; zero it rather than produce a negative house.
        let raw_house = (grid_power - inverter.ac_power).abs();
        let (house, ev_charger) = if raw_house - ev_load < 0.0 {
            (raw_house, 0.0)
        } else {
            (raw_house - ev_load, ev_load)
        };

        let used_production = if production > delivery {
            production - delivery
        } else {
            0.0
        };
        let used_battery_production = (used_production * factor).round().min(used_production);
        let used_pv_production = used_production - used_battery_production;

        let total = house + ev_charger + consumption;

        let suspect = self.check_pv_jump(pv_production);

        let flow = Powerflow {
            unit: snapshots.unit.clone(),
            timestamp: Utc::now(),
            inverter: InverterFlow {
                power: inverter.ac_power,
                consumption,
                production,
                pv_production,
                battery_production,
            },
            grid: GridFlow {
                power: grid_power,
                consumption: grid_consumption,
                delivery,
            },
            battery: BatteryFlow {
                power: battery_power,
                charge: battery_power.max(0.0),
                discharge: battery_discharge,
            },
            consumer: ConsumerFlow {
                house,
                ev_charger,
                inverter_consumption: consumption,
                used_production,
                used_pv_production,
                used_battery_production,
                total,
            },
            suspect,
        };

        self.validate(&flow)?;
        self.last_pv_production = Some(flow.inverter.pv_production);

        debug!(
            "⚡ Unit '{}': pv {} W, battery {} W, grid {} W, house {} W",
            flow.unit.key,
            flow.inverter.pv_production,
            flow.battery.power,
            flow.grid.power,
            flow.consumer.house
        );

        Ok(flow)
    }

    fn check_pv_jump(&self, pv_production: f64) -> bool {
        if self.last_pv_production == Some(0.0) && pv_production > PV_JUMP_THRESHOLD {
            warn!(
                "⚠️  PV production jumped 0 -> {} W within one cycle, flagging as suspect",
                pv_production
            );
            true
        } else {
            false
        }
    }

    /// An invalid decomposition is never published; the cycle is abandoned
    /// and retried on the next tick.
    fn validate(&self, flow: &Powerflow) -> Result<(), BridgeError> {
        let unsigned_fields = [
            ("inverter.consumption", flow.inverter.consumption),
            ("inverter.production", flow.inverter.production),
            ("inverter.pv_production", flow.inverter.pv_production),
            ("inverter.battery_production", flow.inverter.battery_production),
            ("grid.consumption", flow.grid.consumption),
            ("grid.delivery", flow.grid.delivery),
            ("battery.charge", flow.battery.charge),
            ("battery.discharge", flow.battery.discharge),
            ("consumer.house", flow.consumer.house),
            ("consumer.ev_charger", flow.consumer.ev_charger),
            ("consumer.inverter_consumption", flow.consumer.inverter_consumption),
            ("consumer.used_production", flow.consumer.used_production),
            ("consumer.used_pv_production", flow.consumer.used_pv_production),
            ("consumer.used_battery_production", flow.consumer.used_battery_production),
            ("consumer.total", flow.consumer.total),
        ];

        for (name, value) in unsigned_fields {
            if value < 0.0 {
                return Err(BridgeError::InvalidPowerflow(format!(
                    "{} is negative: {}",
                    name, value
                )));
            }
        }

        let split_sum = flow.inverter.pv_production + flow.inverter.battery_production;
        if (split_sum - flow.inverter.production).abs() > EPSILON {
            return Err(BridgeError::InvalidPowerflow(format!(
                "production split mismatch: {} + {} != {}",
                flow.inverter.pv_production,
                flow.inverter.battery_production,
                flow.inverter.production
            )));
        }

        let used_sum = flow.consumer.used_pv_production + flow.consumer.used_battery_production;
        if used_sum > flow.consumer.total + EPSILON {
            return Err(BridgeError::InvalidPowerflow(format!(
                "used production {} exceeds total consumption {}",
                used_sum, flow.consumer.total
            )));
        }

        // Delivering more than the inverter produces means PV is metered
        // outside its DC input; only valid when configured as such.
        if !self.external_production && flow.grid.delivery > flow.inverter.production + EPSILON {
            return Err(BridgeError::InvalidPowerflow(format!(
                "grid delivery {} exceeds production {} without external production",
                flow.grid.delivery, flow.inverter.production
            )));
        }

        Ok(())
    }
}

fn grid_power(meters: &BTreeMap<usize, MeterData>) -> f64 {
    meters
        .values()
        .filter(|meter| meter.measures_import_export())
        .map(|meter| meter.ac_power)
        .sum()
}

fn battery_power(batteries: &BTreeMap<usize, BatteryData>) -> f64 {
    batteries.values().map(|battery| battery.instantaneous_power).sum()
}

/// Sum per-unit decompositions field by field into one Cumulated flow.
///
/// The battery factor is non-linear per unit, so summing raw power first
/// and re-deriving the PV/battery split would give a different, wrong
/// answer than summing the already-split per-unit results.
pub fn cumulate<'a, I>(flows: I) -> Powerflow
where
    I: IntoIterator<Item = &'a Powerflow>,
{
    let mut result = Powerflow {
        unit: UnitIdentity::cumulated(),
        timestamp: Utc::now(),
        inverter: InverterFlow::default(),
        grid: GridFlow::default(),
        battery: BatteryFlow::default(),
        consumer: ConsumerFlow::default(),
        suspect: false,
    };

    for flow in flows {
        result.inverter.power += flow.inverter.power;
        result.inverter.consumption += flow.inverter.consumption;
        result.inverter.production += flow.inverter.production;
        result.inverter.pv_production += flow.inverter.pv_production;
        result.inverter.battery_production += flow.inverter.battery_production;

        result.grid.power += flow.grid.power;
        result.grid.consumption += flow.grid.consumption;
        result.grid.delivery += flow.grid.delivery;

        result.battery.power += flow.battery.power;
        result.battery.charge += flow.battery.charge;
        result.battery.discharge += flow.battery.discharge;

        result.consumer.house += flow.consumer.house;
        result.consumer.ev_charger += flow.consumer.ev_charger;
        result.consumer.inverter_consumption += flow.consumer.inverter_consumption;
        result.consumer.used_production += flow.consumer.used_production;
        result.consumer.used_pv_production += flow.consumer.used_pv_production;
        result.consumer.used_battery_production += flow.consumer.used_battery_production;
        result.consumer.total += flow.consumer.total;

        result.suspect |= flow.suspect;
    }

    result
}
