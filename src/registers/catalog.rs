//! Per device-kind register tables.
//!
//! Layouts follow the SunSpec convention: a common identity block followed
//! by a model block. The inverter block also advertises which meter and
//! battery slots are populated; the reader probes optional devices from
//! those words instead of blind-scanning addresses.

use super::{RegisterDescriptor, ValueType};
use crate::modbus::protocol::MAX_REGISTERS_PER_READ;

pub const METER_SLOTS: usize = 3;
pub const BATTERY_SLOTS: usize = 2;

const INVERTER_BASE: u16 = 40_000;
const METER_BASE: u16 = 40_121;
const METER_BLOCK_LEN: u16 = 174;
const BATTERY_BASE: u16 = 0xE100;
const BATTERY_BLOCK_LEN: u16 = 0x100;
const STORAGE_BASE: u16 = 0xE004;

use self::ValueType::{Float32, Int16, UInt16, UInt32, UInt64};

static INVERTER: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("c_sunspec_id", INVERTER_BASE, UInt32),
    RegisterDescriptor::new("c_sunspec_did", INVERTER_BASE + 2, UInt16),
    RegisterDescriptor::new("c_sunspec_length", INVERTER_BASE + 3, UInt16),
    RegisterDescriptor::text("c_manufacturer", INVERTER_BASE + 4, 16),
    RegisterDescriptor::text("c_model", INVERTER_BASE + 20, 16),
    RegisterDescriptor::text("c_version", INVERTER_BASE + 44, 8),
    RegisterDescriptor::text("c_serialnumber", INVERTER_BASE + 52, 16),
    RegisterDescriptor::new("c_deviceaddress", INVERTER_BASE + 68, UInt16),
    RegisterDescriptor::new("sunspec_did", INVERTER_BASE + 69, UInt16),
    RegisterDescriptor::new("ac_current", INVERTER_BASE + 71, UInt16),
    RegisterDescriptor::new("ac_current_a", INVERTER_BASE + 72, UInt16),
    RegisterDescriptor::new("ac_current_b", INVERTER_BASE + 73, UInt16),
    RegisterDescriptor::new("ac_current_c", INVERTER_BASE + 74, UInt16),
    RegisterDescriptor::new("ac_current_sf", INVERTER_BASE + 75, Int16),
    RegisterDescriptor::new("ac_voltage_ab", INVERTER_BASE + 76, UInt16),
    RegisterDescriptor::new("ac_voltage_bc", INVERTER_BASE + 77, UInt16),
    RegisterDescriptor::new("ac_voltage_ca", INVERTER_BASE + 78, UInt16),
    RegisterDescriptor::new("ac_voltage_an", INVERTER_BASE + 79, UInt16),
    RegisterDescriptor::new("ac_voltage_bn", INVERTER_BASE + 80, UInt16),
    RegisterDescriptor::new("ac_voltage_cn", INVERTER_BASE + 81, UInt16),
    RegisterDescriptor::new("ac_voltage_sf", INVERTER_BASE + 82, Int16),
    RegisterDescriptor::new("ac_power", INVERTER_BASE + 83, Int16),
    RegisterDescriptor::new("ac_power_sf", INVERTER_BASE + 84, Int16),
    RegisterDescriptor::new("ac_frequency", INVERTER_BASE + 85, UInt16),
    RegisterDescriptor::new("ac_frequency_sf", INVERTER_BASE + 86, Int16),
    RegisterDescriptor::new("ac_va", INVERTER_BASE + 87, Int16),
    RegisterDescriptor::new("ac_va_sf", INVERTER_BASE + 88, Int16),
    RegisterDescriptor::new("ac_var", INVERTER_BASE + 89, Int16),
    RegisterDescriptor::new("ac_var_sf", INVERTER_BASE + 90, Int16),
    RegisterDescriptor::new("ac_pf", INVERTER_BASE + 91, Int16),
    RegisterDescriptor::new("ac_pf_sf", INVERTER_BASE + 92, Int16),
    RegisterDescriptor::new("ac_energy_wh", INVERTER_BASE + 93, UInt32),
    RegisterDescriptor::new("ac_energy_wh_sf", INVERTER_BASE + 95, Int16),
    RegisterDescriptor::new("dc_current", INVERTER_BASE + 96, UInt16),
    RegisterDescriptor::new("dc_current_sf", INVERTER_BASE + 97, Int16),
    RegisterDescriptor::new("dc_voltage", INVERTER_BASE + 98, UInt16),
    RegisterDescriptor::new("dc_voltage_sf", INVERTER_BASE + 99, Int16),
    RegisterDescriptor::new("dc_power", INVERTER_BASE + 100, Int16),
    RegisterDescriptor::new("dc_power_sf", INVERTER_BASE + 101, Int16),
    RegisterDescriptor::new("temp_sink", INVERTER_BASE + 103, Int16),
    RegisterDescriptor::new("temp_sf", INVERTER_BASE + 106, Int16),
    RegisterDescriptor::new("status", INVERTER_BASE + 107, UInt16),
    RegisterDescriptor::new("status_vendor", INVERTER_BASE + 108, UInt16),
    // Populated-slot advertisement words; a zero address means the slot is
    // empty regardless of configuration.
    RegisterDescriptor::new("meter_address_0", INVERTER_BASE + 109, UInt16),
    RegisterDescriptor::new("meter_address_1", INVERTER_BASE + 110, UInt16),
    RegisterDescriptor::new("meter_address_2", INVERTER_BASE + 111, UInt16),
    RegisterDescriptor::new("battery_address_0", INVERTER_BASE + 112, UInt16),
    RegisterDescriptor::new("battery_address_1", INVERTER_BASE + 113, UInt16),
];

/// Meter model template, addresses relative to the slot base.
static METER_TEMPLATE: &[RegisterDescriptor] = &[
    RegisterDescriptor::text("c_manufacturer", 2, 16),
    RegisterDescriptor::text("c_model", 18, 16),
    RegisterDescriptor::text("c_option", 34, 8),
    RegisterDescriptor::text("c_version", 42, 8),
    RegisterDescriptor::text("c_serialnumber", 50, 16),
    RegisterDescriptor::new("c_deviceaddress", 66, UInt16),
    RegisterDescriptor::new("sunspec_did", 67, UInt16),
    RegisterDescriptor::new("ac_current", 69, Int16),
    RegisterDescriptor::new("ac_current_a", 70, Int16),
    RegisterDescriptor::new("ac_current_b", 71, Int16),
    RegisterDescriptor::new("ac_current_c", 72, Int16),
    RegisterDescriptor::new("ac_current_sf", 73, Int16),
    RegisterDescriptor::new("ac_voltage_ln", 74, Int16),
    RegisterDescriptor::new("ac_voltage_an", 75, Int16),
    RegisterDescriptor::new("ac_voltage_bn", 76, Int16),
    RegisterDescriptor::new("ac_voltage_cn", 77, Int16),
    RegisterDescriptor::new("ac_voltage_ll", 78, Int16),
    RegisterDescriptor::new("ac_voltage_sf", 82, Int16),
    RegisterDescriptor::new("ac_frequency", 83, Int16),
    RegisterDescriptor::new("ac_frequency_sf", 84, Int16),
    RegisterDescriptor::new("ac_power", 85, Int16),
    RegisterDescriptor::new("ac_power_a", 86, Int16),
    RegisterDescriptor::new("ac_power_b", 87, Int16),
    RegisterDescriptor::new("ac_power_c", 88, Int16),
    RegisterDescriptor::new("ac_power_sf", 89, Int16),
    RegisterDescriptor::new("ac_va", 90, Int16),
    RegisterDescriptor::new("ac_va_sf", 94, Int16),
    RegisterDescriptor::new("ac_var", 95, Int16),
    RegisterDescriptor::new("ac_var_sf", 99, Int16),
    RegisterDescriptor::new("ac_pf", 100, Int16),
    RegisterDescriptor::new("ac_pf_sf", 104, Int16),
    RegisterDescriptor::new("exported_wh", 105, UInt32),
    RegisterDescriptor::new("imported_wh", 113, UInt32),
    RegisterDescriptor::new("energy_wh_sf", 121, Int16),
];

/// Battery block template, addresses relative to the slot base.
static BATTERY_TEMPLATE: &[RegisterDescriptor] = &[
    RegisterDescriptor::text("manufacturer", 0x00, 16),
    RegisterDescriptor::text("model", 0x10, 16),
    RegisterDescriptor::text("firmware_version", 0x20, 16),
    RegisterDescriptor::text("serialnumber", 0x30, 16),
    RegisterDescriptor::new("device_id", 0x40, UInt16),
    RegisterDescriptor::new("rated_energy", 0x42, Float32),
    RegisterDescriptor::new("max_charge_continuous_power", 0x44, Float32),
    RegisterDescriptor::new("max_discharge_continuous_power", 0x46, Float32),
    RegisterDescriptor::new("max_charge_peak_power", 0x48, Float32),
    RegisterDescriptor::new("max_discharge_peak_power", 0x4A, Float32),
    RegisterDescriptor::new("average_temperature", 0x6C, Float32),
    RegisterDescriptor::new("max_temperature", 0x6E, Float32),
    RegisterDescriptor::new("instantaneous_voltage", 0x70, Float32),
    RegisterDescriptor::new("instantaneous_current", 0x72, Float32),
    RegisterDescriptor::new("instantaneous_power", 0x74, Float32),
    RegisterDescriptor::new("lifetime_export_energy", 0x76, UInt64),
    RegisterDescriptor::new("lifetime_import_energy", 0x7A, UInt64),
    RegisterDescriptor::new("max_energy", 0x7E, Float32),
    RegisterDescriptor::new("available_energy", 0x80, Float32),
    RegisterDescriptor::new("soh", 0x82, Float32),
    RegisterDescriptor::new("soe", 0x84, Float32),
    RegisterDescriptor::new("status", 0x86, UInt32),
    RegisterDescriptor::new("status_internal", 0x88, UInt32),
];

static STORAGE_CONTROL: &[RegisterDescriptor] = &[
    RegisterDescriptor::writable("control_mode", STORAGE_BASE, UInt16),
    RegisterDescriptor::writable("ac_charge_policy", STORAGE_BASE + 1, UInt16),
    RegisterDescriptor::writable("ac_charge_limit", STORAGE_BASE + 2, Float32),
    RegisterDescriptor::writable("backup_reserved", STORAGE_BASE + 4, Float32),
    RegisterDescriptor::writable("default_mode", STORAGE_BASE + 6, UInt16),
    RegisterDescriptor::writable("remote_command_timeout", STORAGE_BASE + 7, UInt32),
    RegisterDescriptor::writable("remote_command_mode", STORAGE_BASE + 9, UInt16),
    RegisterDescriptor::writable("remote_charge_limit", STORAGE_BASE + 10, Float32),
    RegisterDescriptor::writable("remote_discharge_limit", STORAGE_BASE + 12, Float32),
];

pub fn inverter_registers() -> Vec<RegisterDescriptor> {
    INVERTER.to_vec()
}

pub fn meter_registers(slot: usize) -> Vec<RegisterDescriptor> {
    assert!(slot < METER_SLOTS, "meter slot out of range: {}", slot);
    let base = METER_BASE + METER_BLOCK_LEN * slot as u16;
    rebase(METER_TEMPLATE, base)
}

pub fn battery_registers(slot: usize) -> Vec<RegisterDescriptor> {
    assert!(slot < BATTERY_SLOTS, "battery slot out of range: {}", slot);
    let base = BATTERY_BASE + BATTERY_BLOCK_LEN * slot as u16;
    rebase(BATTERY_TEMPLATE, base)
}

pub fn storage_control_registers() -> Vec<RegisterDescriptor> {
    STORAGE_CONTROL.to_vec()
}

fn rebase(template: &[RegisterDescriptor], base: u16) -> Vec<RegisterDescriptor> {
    template
        .iter()
        .map(|reg| {
            let mut reg = reg.clone();
            reg.address += base;
            reg
        })
        .collect()
}

/// An ordered run of registers whose address span fits one read transaction.
#[derive(Debug, Clone)]
pub struct RegisterBundle {
    pub registers: Vec<RegisterDescriptor>,
}

impl RegisterBundle {
    pub fn start_address(&self) -> u16 {
        self.registers.first().map(|r| r.address).unwrap_or(0)
    }

    /// Words to request: the full span including gaps between registers.
    pub fn word_count(&self) -> u16 {
        match (self.registers.first(), self.registers.last()) {
            (Some(first), Some(last)) => last.end_address() - first.address,
            _ => 0,
        }
    }
}

/// Group descriptors into minimal round-trip windows.
///
/// Descriptors are sorted by address; a new bundle starts whenever including
/// the next register would stretch the window past the transport limit.
pub fn bundle(descriptors: &[RegisterDescriptor]) -> Vec<RegisterBundle> {
    let mut sorted: Vec<RegisterDescriptor> = descriptors.to_vec();
    sorted.sort_by_key(|r| r.address);

    let mut bundles: Vec<RegisterBundle> = Vec::new();
    let mut current: Vec<RegisterDescriptor> = Vec::new();
    let mut window_start: u16 = 0;

    for reg in sorted {
        let fits = !current.is_empty()
            && (reg.end_address() - window_start) <= MAX_REGISTERS_PER_READ;

        if current.is_empty() {
            window_start = reg.address;
            current.push(reg);
        } else if fits {
            current.push(reg);
        } else {
            bundles.push(RegisterBundle { registers: std::mem::take(&mut current) });
            window_start = reg.address;
            current.push(reg);
        }
    }

    if !current.is_empty() {
        bundles.push(RegisterBundle { registers: current });
    }

    bundles
}
