//! Static register maps and the codec that turns raw register words into
//! typed, scaled values and back.

pub mod catalog;
pub mod codec;

pub use catalog::{
    battery_registers, bundle, inverter_registers, meter_registers, storage_control_registers,
    RegisterBundle, BATTERY_SLOTS, METER_SLOTS,
};
pub use codec::{decode_bundle, encode_register, scaled_value, DecodedBlock};

/// Value interpretation of a register's words. One decode/encode behavior
/// per variant, resolved statically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Int16,
    Int32,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    String,
}

impl ValueType {
    /// Number of 16-bit words the type occupies on the wire. Strings have
    /// no natural length; the descriptor must declare one.
    pub const fn natural_length(&self) -> u16 {
        match self {
            ValueType::Int16 | ValueType::UInt16 => 1,
            ValueType::Int32 | ValueType::UInt32 | ValueType::Float32 => 2,
            ValueType::UInt64 => 4,
            ValueType::String => 1,
        }
    }
}

/// A typed register value as produced by one decode pass.
///
/// `NotImplemented` is the explicit decoding of a type's reserved sentinel
/// word pattern (a device advertising "this register exists but holds no
/// data"), distinct from a decode failure.
#[derive(Debug, Clone, PartialEq)]
pub enum RegisterValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    NotImplemented,
}

impl RegisterValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            RegisterValue::Int(v) => Some(*v),
            RegisterValue::UInt(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            RegisterValue::UInt(v) => Some(*v),
            RegisterValue::Int(v) if *v >= 0 => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            RegisterValue::Int(v) => Some(*v as f64),
            RegisterValue::UInt(v) => Some(*v as f64),
            RegisterValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            RegisterValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_not_implemented(&self) -> bool {
        matches!(self, RegisterValue::NotImplemented)
    }
}

impl std::fmt::Display for RegisterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterValue::Int(v) => write!(f, "{}", v),
            RegisterValue::UInt(v) => write!(f, "{}", v),
            RegisterValue::Float(v) => write!(f, "{}", v),
            RegisterValue::Text(s) => write!(f, "\"{}\"", s),
            RegisterValue::NotImplemented => write!(f, "n/a"),
        }
    }
}

/// Immutable description of one register: where it lives, how to decode it,
/// and whether the device accepts writes to it.
#[derive(Debug, Clone)]
pub struct RegisterDescriptor {
    pub id: &'static str,
    pub address: u16,
    pub value_type: ValueType,
    pub length: u16,
    pub writable: bool,
}

impl RegisterDescriptor {
    pub const fn new(id: &'static str, address: u16, value_type: ValueType) -> Self {
        Self {
            id,
            address,
            value_type,
            length: value_type.natural_length(),
            writable: false,
        }
    }

    pub const fn text(id: &'static str, address: u16, length: u16) -> Self {
        Self {
            id,
            address,
            value_type: ValueType::String,
            length,
            writable: false,
        }
    }

    pub const fn writable(id: &'static str, address: u16, value_type: ValueType) -> Self {
        Self {
            id,
            address,
            value_type,
            length: value_type.natural_length(),
            writable: true,
        }
    }

    /// Words occupied on the wire: declared length, never less than the
    /// type's natural length.
    pub fn effective_length(&self) -> u16 {
        self.length.max(self.value_type.natural_length())
    }

    /// First address past this register.
    pub fn end_address(&self) -> u16 {
        self.address + self.effective_length()
    }
}
