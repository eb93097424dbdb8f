//! Immutable per-device snapshots, produced once per poll cycle from one
//! decode pass and superseded by the next cycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registers::codec::{scaled_value, DecodedBlock};
use crate::utils::error::BridgeError;

/// Role of a unit in a chained installation. Exactly one Leader per
/// installation; Cumulated is synthesized by the powerflow engine and never
/// read from hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitRole {
    Leader,
    Follower,
    Cumulated,
}

impl std::fmt::Display for UnitRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitRole::Leader => write!(f, "leader"),
            UnitRole::Follower => write!(f, "follower"),
            UnitRole::Cumulated => write!(f, "cumulated"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIdentity {
    pub index: usize,
    pub role: UnitRole,
    pub key: String,
}

impl UnitIdentity {
    pub fn cumulated() -> Self {
        Self {
            index: usize::MAX,
            role: UnitRole::Cumulated,
            key: "cumulated".to_string(),
        }
    }
}

/// SunSpec common-block identity shared by every physical device kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub manufacturer: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub option: Option<String>,
    pub version: String,
    pub serialnumber: String,
    pub device_address: u16,
    pub sunspec_did: u16,
}

/// SunSpec inverter operating state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InverterStatus {
    Off,
    Sleeping,
    Starting,
    Producing,
    Throttled,
    ShuttingDown,
    Fault,
    Standby,
    Unknown,
}

impl From<u16> for InverterStatus {
    fn from(value: u16) -> Self {
        use InverterStatus::*;

        match value {
            1 => Off,
            2 => Sleeping,
            3 => Starting,
            4 => Producing,
            5 => Throttled,
            6 => ShuttingDown,
            7 => Fault,
            8 => Standby,
            _ => Unknown,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InverterData {
    pub identity: DeviceIdentity,
    pub timestamp: DateTime<Utc>,

    pub ac_current: f64,
    pub ac_voltage: f64,
    pub ac_power: f64,
    pub ac_frequency: f64,
    pub ac_apparent_power: f64,
    pub ac_reactive_power: f64,
    pub ac_power_factor: f64,
    pub ac_energy_total: f64,
    pub dc_current: f64,
    pub dc_voltage: f64,
    pub dc_power: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    pub status: InverterStatus,
    pub status_vendor: u16,
}

impl InverterData {
    pub fn from_block(block: &DecodedBlock) -> Result<Self, BridgeError> {
        Ok(Self {
            identity: common_identity(block)?,
            timestamp: Utc::now(),
            ac_current: power_field(block, "ac_current", "ac_current_sf"),
            ac_voltage: power_field(block, "ac_voltage_an", "ac_voltage_sf"),
            ac_power: required_scaled(block, "ac_power", "ac_power_sf")?,
            ac_frequency: power_field(block, "ac_frequency", "ac_frequency_sf"),
            ac_apparent_power: power_field(block, "ac_va", "ac_va_sf"),
            ac_reactive_power: power_field(block, "ac_var", "ac_var_sf"),
            ac_power_factor: power_field(block, "ac_pf", "ac_pf_sf"),
            ac_energy_total: power_field(block, "ac_energy_wh", "ac_energy_wh_sf"),
            dc_current: power_field(block, "dc_current", "dc_current_sf"),
            dc_voltage: power_field(block, "dc_voltage", "dc_voltage_sf"),
            dc_power: required_scaled(block, "dc_power", "dc_power_sf")?,
            temperature: scaled_value(block, "temp_sink", "temp_sf"),
            status: InverterStatus::from(u16_field(block, "status").unwrap_or(0)),
            status_vendor: u16_field(block, "status_vendor").unwrap_or(0),
        })
    }

    /// AC power fed towards the grid side, never negative.
    pub fn production(&self) -> f64 {
        self.ac_power.max(0.0)
    }

    /// AC power drawn by the inverter itself (e.g. night standby), never
    /// negative. Production and consumption are mutually exclusive.
    pub fn consumption(&self) -> f64 {
        (-self.ac_power).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterData {
    pub identity: DeviceIdentity,
    pub timestamp: DateTime<Utc>,

    pub ac_current: f64,
    pub ac_voltage: f64,
    pub ac_frequency: f64,
    pub ac_power: f64,
    pub ac_apparent_power: f64,
    pub ac_reactive_power: f64,
    pub ac_power_factor: f64,
    pub exported_energy: f64,
    pub imported_energy: f64,
}

impl MeterData {
    pub fn from_block(block: &DecodedBlock) -> Result<Self, BridgeError> {
        Ok(Self {
            identity: common_identity(block)?,
            timestamp: Utc::now(),
            ac_current: power_field(block, "ac_current", "ac_current_sf"),
            ac_voltage: power_field(block, "ac_voltage_ln", "ac_voltage_sf"),
            ac_frequency: power_field(block, "ac_frequency", "ac_frequency_sf"),
            ac_power: required_scaled(block, "ac_power", "ac_power_sf")?,
            ac_apparent_power: power_field(block, "ac_va", "ac_va_sf"),
            ac_reactive_power: power_field(block, "ac_var", "ac_var_sf"),
            ac_power_factor: power_field(block, "ac_pf", "ac_pf_sf"),
            exported_energy: power_field(block, "exported_wh", "energy_wh_sf"),
            imported_energy: power_field(block, "imported_wh", "energy_wh_sf"),
        })
    }

    /// Meters count towards grid power only when they measure both
    /// directions; production-only meters would skew the signed sum.
    pub fn measures_import_export(&self) -> bool {
        self.identity
            .option
            .as_deref()
            .map(|option| option.contains("Export") && option.contains("Import"))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryData {
    pub identity: DeviceIdentity,
    pub timestamp: DateTime<Utc>,

    pub rated_energy: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_temperature: Option<f64>,
    pub instantaneous_voltage: f64,
    pub instantaneous_current: f64,
    pub instantaneous_power: f64,
    pub lifetime_export_energy: u64,
    pub lifetime_import_energy: u64,
    pub max_energy: f64,
    pub available_energy: f64,
    pub state_of_health: f64,
    pub state_of_charge: f64,
    pub status: u32,
}

impl BatteryData {
    pub fn from_block(block: &DecodedBlock) -> Result<Self, BridgeError> {
        let identity = DeviceIdentity {
            manufacturer: text_field(block, "manufacturer")?,
            model: text_field(block, "model")?,
            option: None,
            version: text_field(block, "firmware_version")?,
            serialnumber: text_field(block, "serialnumber")?,
            device_address: u16_field(block, "device_id").unwrap_or(0),
            sunspec_did: 0,
        };

        Ok(Self {
            identity,
            timestamp: Utc::now(),
            rated_energy: float_field(block, "rated_energy").unwrap_or(0.0),
            average_temperature: float_field(block, "average_temperature"),
            instantaneous_voltage: float_field(block, "instantaneous_voltage").unwrap_or(0.0),
            instantaneous_current: float_field(block, "instantaneous_current").unwrap_or(0.0),
            instantaneous_power: required_float(block, "instantaneous_power")?,
            lifetime_export_energy: u64_field(block, "lifetime_export_energy").unwrap_or(0),
            lifetime_import_energy: u64_field(block, "lifetime_import_energy").unwrap_or(0),
            max_energy: float_field(block, "max_energy").unwrap_or(0.0),
            available_energy: float_field(block, "available_energy").unwrap_or(0.0),
            state_of_health: float_field(block, "soh").unwrap_or(0.0),
            state_of_charge: float_field(block, "soe").unwrap_or(0.0),
            status: u32_field(block, "status").unwrap_or(0),
        })
    }

    /// Positive instantaneous power means charging.
    pub fn charge_power(&self) -> f64 {
        self.instantaneous_power.max(0.0)
    }

    pub fn discharge_power(&self) -> f64 {
        (-self.instantaneous_power).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageControlData {
    pub timestamp: DateTime<Utc>,
    pub control_mode: u16,
    pub ac_charge_policy: u16,
    pub ac_charge_limit: f64,
    pub backup_reserved: f64,
    pub default_mode: u16,
    pub remote_command_timeout: u32,
    pub remote_command_mode: u16,
    pub remote_charge_limit: f64,
    pub remote_discharge_limit: f64,
}

impl StorageControlData {
    pub fn from_block(block: &DecodedBlock) -> Result<Self, BridgeError> {
        Ok(Self {
            timestamp: Utc::now(),
            control_mode: u16_field(block, "control_mode").unwrap_or(0),
            ac_charge_policy: u16_field(block, "ac_charge_policy").unwrap_or(0),
            ac_charge_limit: float_field(block, "ac_charge_limit").unwrap_or(0.0),
            backup_reserved: float_field(block, "backup_reserved").unwrap_or(0.0),
            default_mode: u16_field(block, "default_mode").unwrap_or(0),
            remote_command_timeout: u32_field(block, "remote_command_timeout").unwrap_or(0),
            remote_command_mode: u16_field(block, "remote_command_mode").unwrap_or(0),
            remote_charge_limit: float_field(block, "remote_charge_limit").unwrap_or(0.0),
            remote_discharge_limit: float_field(block, "remote_discharge_limit").unwrap_or(0.0),
        })
    }
}

fn common_identity(block: &DecodedBlock) -> Result<DeviceIdentity, BridgeError> {
    Ok(DeviceIdentity {
        manufacturer: text_field(block, "c_manufacturer")?,
        model: text_field(block, "c_model")?,
        option: block.get("c_option").and_then(|v| v.as_text()).map(str::to_string),
        version: text_field(block, "c_version")?,
        serialnumber: text_field(block, "c_serialnumber")?,
        device_address: u16_field(block, "c_deviceaddress").unwrap_or(0),
        sunspec_did: u16_field(block, "sunspec_did").unwrap_or(0),
    })
}

fn text_field(block: &DecodedBlock, id: &'static str) -> Result<String, BridgeError> {
    block
        .get(id)
        .and_then(|v| v.as_text())
        .map(str::to_string)
        .ok_or_else(|| BridgeError::InvalidData(format!("register '{}' missing or not a string", id)))
}

/// Scaled quantity that must be present for the snapshot to make sense.
fn required_scaled(
    block: &DecodedBlock,
    value_id: &'static str,
    scale_id: &'static str,
) -> Result<f64, BridgeError> {
    scaled_value(block, value_id, scale_id)
        .ok_or_else(|| BridgeError::InvalidData(format!("register '{}' missing or absent", value_id)))
}

fn required_float(block: &DecodedBlock, id: &'static str) -> Result<f64, BridgeError> {
    float_field(block, id)
        .ok_or_else(|| BridgeError::InvalidData(format!("register '{}' missing or absent", id)))
}

/// Scaled quantity that defaults to zero when the device marks it not
/// implemented (a sleeping inverter drops most of its model block).
fn power_field(block: &DecodedBlock, value_id: &str, scale_id: &str) -> f64 {
    scaled_value(block, value_id, scale_id).unwrap_or(0.0)
}

fn float_field(block: &DecodedBlock, id: &str) -> Option<f64> {
    block.get(id).and_then(|v| v.as_f64())
}

fn u16_field(block: &DecodedBlock, id: &str) -> Option<u16> {
    block.get(id).and_then(|v| v.as_u64()).and_then(|v| u16::try_from(v).ok())
}

fn u32_field(block: &DecodedBlock, id: &str) -> Option<u32> {
    block.get(id).and_then(|v| v.as_u64()).and_then(|v| u32::try_from(v).ok())
}

fn u64_field(block: &DecodedBlock, id: &str) -> Option<u64> {
    block.get(id).and_then(|v| v.as_u64())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::RegisterValue;

    fn inverter_block(ac_power: i64, ac_sf: i64, dc_power: i64, dc_sf: i64) -> DecodedBlock {
        let mut block = DecodedBlock::new();
        block.insert("c_manufacturer", RegisterValue::Text("SolarEdge".into()));
        block.insert("c_model", RegisterValue::Text("SE10K".into()));
        block.insert("c_version", RegisterValue::Text("0004.0009".into()));
        block.insert("c_serialnumber", RegisterValue::Text("7E123456".into()));
        block.insert("c_deviceaddress", RegisterValue::UInt(1));
        block.insert("sunspec_did", RegisterValue::UInt(103));
        block.insert("ac_power", RegisterValue::Int(ac_power));
        block.insert("ac_power_sf", RegisterValue::Int(ac_sf));
        block.insert("dc_power", RegisterValue::Int(dc_power));
        block.insert("dc_power_sf", RegisterValue::Int(dc_sf));
        block.insert("status", RegisterValue::UInt(4));
        block
    }

    #[test]
    fn test_inverter_production_consumption_exclusive() {
        let producing = InverterData::from_block(&inverter_block(1000, 0, 1200, 0)).unwrap();
        assert_eq!(producing.production(), 1000.0);
        assert_eq!(producing.consumption(), 0.0);

        let consuming = InverterData::from_block(&inverter_block(-25, 0, 0, 0)).unwrap();
        assert_eq!(consuming.production(), 0.0);
        assert_eq!(consuming.consumption(), 25.0);

        for snapshot in [&producing, &consuming] {
            assert!(snapshot.production() >= 0.0);
            assert!(snapshot.consumption() >= 0.0);
            assert!(!(snapshot.production() > 0.0 && snapshot.consumption() > 0.0));
        }
    }

    #[test]
    fn test_inverter_scale_applied() {
        let snapshot = InverterData::from_block(&inverter_block(10690, -1, 16690, -1)).unwrap();
        assert_eq!(snapshot.ac_power, 1069.0);
        assert_eq!(snapshot.dc_power, 1669.0);
        assert_eq!(snapshot.status, InverterStatus::Producing);
    }

    #[test]
    fn test_inverter_missing_power_is_an_error() {
        let mut block = inverter_block(0, 0, 0, 0);
        block.remove("ac_power");
        assert!(InverterData::from_block(&block).is_err());
    }

    #[test]
    fn test_meter_import_export_tagging() {
        let mut block = DecodedBlock::new();
        block.insert("c_manufacturer", RegisterValue::Text("WattNode".into()));
        block.insert("c_model", RegisterValue::Text("WNC-3Y-400-MB".into()));
        block.insert("c_option", RegisterValue::Text("Export+Import".into()));
        block.insert("c_version", RegisterValue::Text("25".into()));
        block.insert("c_serialnumber", RegisterValue::Text("M1001".into()));
        block.insert("c_deviceaddress", RegisterValue::UInt(2));
        block.insert("sunspec_did", RegisterValue::UInt(203));
        block.insert("ac_power", RegisterValue::Int(-500));
        block.insert("ac_power_sf", RegisterValue::Int(0));

        let meter = MeterData::from_block(&block).unwrap();
        assert!(meter.measures_import_export());
        assert_eq!(meter.ac_power, -500.0);

        let mut production_only = block.clone();
        production_only.insert("c_option", RegisterValue::Text("Production".into()));
        assert!(!MeterData::from_block(&production_only).unwrap().measures_import_export());
    }

    #[test]
    fn test_battery_charge_discharge() {
        let mut block = DecodedBlock::new();
        block.insert("manufacturer", RegisterValue::Text("LG".into()));
        block.insert("model", RegisterValue::Text("RESU10H".into()));
        block.insert("firmware_version", RegisterValue::Text("1.0".into()));
        block.insert("serialnumber", RegisterValue::Text("B1".into()));
        block.insert("device_id", RegisterValue::UInt(15));
        block.insert("instantaneous_power", RegisterValue::Float(-600.0));
        block.insert("soe", RegisterValue::Float(72.5));

        let battery = BatteryData::from_block(&block).unwrap();
        assert_eq!(battery.discharge_power(), 600.0);
        assert_eq!(battery.charge_power(), 0.0);
        assert_eq!(battery.state_of_charge, 72.5);
    }

    #[test]
    fn test_unit_identity_cumulated() {
        let unit = UnitIdentity::cumulated();
        assert_eq!(unit.role, UnitRole::Cumulated);
        assert_eq!(unit.key, "cumulated");
    }
}
