use log::{debug, error, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use crate::modbus::ModbusClientTrait;
use crate::registers::codec::{decode_bundle, DecodedBlock};
use crate::registers::{
    battery_registers, bundle, inverter_registers, meter_registers, storage_control_registers,
    RegisterBundle, BATTERY_SLOTS, METER_SLOTS,
};
use crate::utils::error::BridgeError;

use super::snapshots::{
    BatteryData, InverterData, MeterData, StorageControlData, UnitIdentity,
};

/// Consecutive failures after which a meter/battery slot is considered dead
/// and skipped on later cycles.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// All snapshots one unit produced in one poll cycle, keyed by slot.
#[derive(Debug, Clone)]
pub struct UnitSnapshots {
    pub unit: UnitIdentity,
    pub inverter: InverterData,
    pub meters: BTreeMap<usize, MeterData>,
    pub batteries: BTreeMap<usize, BatteryData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Slot {
    Meter(usize),
    Battery(usize),
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Slot::Meter(n) => write!(f, "meter {}", n),
            Slot::Battery(n) => write!(f, "battery {}", n),
        }
    }
}

/// Which optional devices to read this cycle. Pure decision table over the
/// configured enable flags and the presence words from the inverter window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbePlan {
    pub meters: [bool; METER_SLOTS],
    pub batteries: [bool; BATTERY_SLOTS],
}

pub fn probe_plan(
    enabled_meters: &[usize],
    enabled_batteries: &[usize],
    inverter_block: &DecodedBlock,
) -> ProbePlan {
    let advertised = |id: &str| -> bool {
        inverter_block
            .get(id)
            .and_then(|v| v.as_u64())
            .map(|addr| addr != 0)
            .unwrap_or(false)
    };

    let mut plan = ProbePlan::default();
    for slot in 0..METER_SLOTS {
        plan.meters[slot] =
            enabled_meters.contains(&slot) && advertised(&format!("meter_address_{}", slot));
    }
    for slot in 0..BATTERY_SLOTS {
        plan.batteries[slot] =
            enabled_batteries.contains(&slot) && advertised(&format!("battery_address_{}", slot));
    }
    plan
}

/// Reads one unit per cycle: the inverter window first, then every meter
/// and battery the probe plan selects. A failure confined to one optional
/// device is logged and skipped; only an inverter failure aborts the cycle.
pub struct DeviceReader {
    unit: UnitIdentity,
    client: Arc<dyn ModbusClientTrait>,
    enabled_meters: Vec<usize>,
    enabled_batteries: Vec<usize>,
    inverter_bundles: Vec<RegisterBundle>,
    meter_bundles: Vec<Vec<RegisterBundle>>,
    battery_bundles: Vec<Vec<RegisterBundle>>,
    storage_bundles: Vec<RegisterBundle>,
    failure_counts: HashMap<Slot, u32>,
    dead_slots: HashSet<Slot>,
}

impl DeviceReader {
    pub fn new(
        unit: UnitIdentity,
        client: Arc<dyn ModbusClientTrait>,
        enabled_meters: Vec<usize>,
        enabled_batteries: Vec<usize>,
    ) -> Self {
        Self {
            unit,
            client,
            enabled_meters,
            enabled_batteries,
            inverter_bundles: bundle(&inverter_registers()),
            meter_bundles: (0..METER_SLOTS).map(|s| bundle(&meter_registers(s))).collect(),
            battery_bundles: (0..BATTERY_SLOTS).map(|s| bundle(&battery_registers(s))).collect(),
            storage_bundles: bundle(&storage_control_registers()),
            failure_counts: HashMap::new(),
            dead_slots: HashSet::new(),
        }
    }

    pub fn unit(&self) -> &UnitIdentity {
        &self.unit
    }

    pub async fn read_cycle(&mut self) -> Result<UnitSnapshots, BridgeError> {
        let inverter_block = self.read_block(&self.inverter_bundles).await?;
        let inverter = InverterData::from_block(&inverter_block).map_err(|e| {
            BridgeError::DeviceMissing(format!("unit '{}' inverter: {}", self.unit.key, e))
        })?;

        let plan = probe_plan(&self.enabled_meters, &self.enabled_batteries, &inverter_block);
        debug!("🔍 Unit '{}' probe plan: {:?}", self.unit.key, plan);

        let mut meters = BTreeMap::new();
        for slot in 0..METER_SLOTS {
            if !plan.meters[slot] || self.is_dead(Slot::Meter(slot)) {
                continue;
            }

            let result = self
                .read_block(&self.meter_bundles[slot])
                .await
                .and_then(|block| MeterData::from_block(&block));
            match result {
                Ok(meter) => {
                    self.note_success(Slot::Meter(slot));
                    meters.insert(slot, meter);
                }
                Err(e) => self.note_failure(Slot::Meter(slot), &inverter, e),
            }
        }

        let mut batteries = BTreeMap::new();
        for slot in 0..BATTERY_SLOTS {
            if !plan.batteries[slot] || self.is_dead(Slot::Battery(slot)) {
                continue;
            }

            let result = self
                .read_block(&self.battery_bundles[slot])
                .await
                .and_then(|block| BatteryData::from_block(&block));
            match result {
                Ok(battery) => {
                    self.note_success(Slot::Battery(slot));
                    batteries.insert(slot, battery);
                }
                Err(e) => self.note_failure(Slot::Battery(slot), &inverter, e),
            }
        }

        info!(
            "📊 Unit '{}' cycle: inverter {} W, {} meter(s), {} batterie(s)",
            self.unit.key,
            inverter.ac_power,
            meters.len(),
            batteries.len()
        );

        Ok(UnitSnapshots {
            unit: self.unit.clone(),
            inverter,
            meters,
            batteries,
        })
    }

    pub async fn read_storage_control(&self) -> Result<StorageControlData, BridgeError> {
        let block = self.read_block(&self.storage_bundles).await?;
        StorageControlData::from_block(&block)
    }

    /// Decoded inverter window without building a snapshot; used by the
    /// register dump and probe commands.
    pub async fn read_inverter_block(&self) -> Result<DecodedBlock, BridgeError> {
        self.read_block(&self.inverter_bundles).await
    }

    pub async fn read_probe_plan(&self) -> Result<ProbePlan, BridgeError> {
        let block = self.read_inverter_block().await?;
        Ok(probe_plan(&self.enabled_meters, &self.enabled_batteries, &block))
    }

    async fn read_block(&self, bundles: &[RegisterBundle]) -> Result<DecodedBlock, BridgeError> {
        let mut block = DecodedBlock::new();
        for b in bundles {
            let words = self
                .client
                .read_holding_registers(b.start_address(), b.word_count())
                .await?;
            block.extend(decode_bundle(b, &words)?);
        }
        Ok(block)
    }

    fn is_dead(&self, slot: Slot) -> bool {
        if self.dead_slots.contains(&slot) {
            debug!("⏸️  Unit '{}': skipping persistently failing {}", self.unit.key, slot);
            true
        } else {
            false
        }
    }

    fn note_success(&mut self, slot: Slot) {
        self.failure_counts.remove(&slot);
    }

    fn note_failure(&mut self, slot: Slot, inverter: &InverterData, err: BridgeError) {
        let count = self.failure_counts.entry(slot).or_insert(0);
        *count += 1;

        warn!(
            "⚠️  Unit '{}' (inverter {} {}): {} failed ({}/{}): {}; skipping this cycle",
            self.unit.key,
            inverter.identity.manufacturer,
            inverter.identity.serialnumber,
            slot,
            count,
            MAX_CONSECUTIVE_FAILURES,
            err
        );

        if *count >= MAX_CONSECUTIVE_FAILURES {
            error!(
                "❌ Unit '{}': {} failed {} cycles in a row, skipping it from now on",
                self.unit.key, slot, MAX_CONSECUTIVE_FAILURES
            );
            self.dead_slots.insert(slot);
        }
    }
}
