//! Decode raw register words into typed values and encode values back for
//! writable registers.
//!
//! Word order is big-endian across a multi-word value, matching the SunSpec
//! convention. Every value type has a reserved "not implemented" sentinel
//! which decodes to an explicit absent value rather than a number.

use std::collections::HashMap;

use super::{RegisterBundle, RegisterDescriptor, RegisterValue, ValueType};
use crate::utils::error::BridgeError;

pub type DecodedBlock = HashMap<&'static str, RegisterValue>;

const NOT_IMPLEMENTED_I16: u16 = 0x8000;
const NOT_IMPLEMENTED_I32: u32 = 0x8000_0000;
const NOT_IMPLEMENTED_U16: u16 = 0xFFFF;
const NOT_IMPLEMENTED_U32: u32 = 0xFFFF_FFFF;
const NOT_IMPLEMENTED_U64: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Decode one bundle's raw words into named values.
///
/// Registers are walked in address order; words covering gaps between
/// registers are discarded.
pub fn decode_bundle(
    bundle: &RegisterBundle,
    raw_words: &[u16],
) -> Result<DecodedBlock, BridgeError> {
    let expected = bundle.word_count() as usize;
    if raw_words.len() < expected {
        return Err(BridgeError::InvalidData(format!(
            "Register block too short: {} words, expected {}",
            raw_words.len(),
            expected
        )));
    }

    let start = bundle.start_address();
    let mut values = HashMap::with_capacity(bundle.registers.len());

    for reg in &bundle.registers {
        let offset = (reg.address - start) as usize;
        let len = reg.effective_length() as usize;
        let words = &raw_words[offset..offset + len];
        values.insert(reg.id, decode_register(reg, words)?);
    }

    Ok(values)
}

pub fn decode_register(
    reg: &RegisterDescriptor,
    words: &[u16],
) -> Result<RegisterValue, BridgeError> {
    debug_assert_eq!(words.len(), reg.effective_length() as usize);

    let value = match reg.value_type {
        ValueType::Int16 => {
            if words[0] == NOT_IMPLEMENTED_I16 {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::Int(words[0] as i16 as i64)
            }
        }
        ValueType::UInt16 => {
            if words[0] == NOT_IMPLEMENTED_U16 {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::UInt(words[0] as u64)
            }
        }
        ValueType::Int32 => {
            let raw = ((words[0] as u32) << 16) | words[1] as u32;
            if raw == NOT_IMPLEMENTED_I32 {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::Int(raw as i32 as i64)
            }
        }
        ValueType::UInt32 => {
            let raw = ((words[0] as u32) << 16) | words[1] as u32;
            if raw == NOT_IMPLEMENTED_U32 {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::UInt(raw as u64)
            }
        }
        ValueType::UInt64 => {
            let raw = words
                .iter()
                .fold(0u64, |acc, &word| (acc << 16) | word as u64);
            if raw == NOT_IMPLEMENTED_U64 {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::UInt(raw)
            }
        }
        ValueType::Float32 => {
            let raw = ((words[0] as u32) << 16) | words[1] as u32;
            let value = f32::from_bits(raw);
            if value.is_nan() {
                RegisterValue::NotImplemented
            } else {
                RegisterValue::Float(value as f64)
            }
        }
        ValueType::String => decode_string(reg, words)?,
    };

    Ok(value)
}

/// A corrupted identity string signals a communication fault or an
/// uninitialized device, so it is surfaced with full register context
/// instead of being silently defaulted.
fn decode_string(
    reg: &RegisterDescriptor,
    words: &[u16],
) -> Result<RegisterValue, BridgeError> {
    let mut bytes = Vec::with_capacity(words.len() * 2);
    for &word in words {
        bytes.push((word >> 8) as u8);
        bytes.push((word & 0xFF) as u8);
    }

    let text = std::str::from_utf8(&bytes).map_err(|e| BridgeError::DecodeError {
        register: reg.id,
        address: reg.address,
        words: words.to_vec(),
        cause: format!("invalid UTF-8: {}", e),
    })?;

    Ok(RegisterValue::Text(
        text.trim_end_matches(['\0', ' ', '\t', '\r', '\n']).to_string(),
    ))
}

/// Encode a value for a writable register, rejecting out-of-domain values.
pub fn encode_register(
    reg: &RegisterDescriptor,
    value: &RegisterValue,
) -> Result<Vec<u16>, BridgeError> {
    if !reg.writable {
        return Err(BridgeError::EncodeError {
            register: reg.id,
            cause: "register is not writable".to_string(),
        });
    }

    let reject = |cause: String| BridgeError::EncodeError { register: reg.id, cause };

    let words = match (reg.value_type, value) {
        (ValueType::Int16, RegisterValue::Int(v)) => {
            let v = i16::try_from(*v)
                .map_err(|_| reject(format!("{} out of range for Int16", v)))?;
            if v as u16 == NOT_IMPLEMENTED_I16 {
                return Err(reject("value collides with the Int16 sentinel".to_string()));
            }
            vec![v as u16]
        }
        (ValueType::UInt16, RegisterValue::UInt(v)) => {
            let v = u16::try_from(*v)
                .map_err(|_| reject(format!("{} out of range for UInt16", v)))?;
            if v == NOT_IMPLEMENTED_U16 {
                return Err(reject("value collides with the UInt16 sentinel".to_string()));
            }
            vec![v]
        }
        (ValueType::Int32, RegisterValue::Int(v)) => {
            let v = i32::try_from(*v)
                .map_err(|_| reject(format!("{} out of range for Int32", v)))?;
            vec![(v as u32 >> 16) as u16, v as u32 as u16]
        }
        (ValueType::UInt32, RegisterValue::UInt(v)) => {
            let v = u32::try_from(*v)
                .map_err(|_| reject(format!("{} out of range for UInt32", v)))?;
            vec![(v >> 16) as u16, v as u16]
        }
        (ValueType::UInt64, RegisterValue::UInt(v)) => {
            vec![
                (*v >> 48) as u16,
                (*v >> 32) as u16,
                (*v >> 16) as u16,
                *v as u16,
            ]
        }
        (ValueType::Float32, RegisterValue::Float(v)) => {
            if !v.is_finite() {
                return Err(reject("non-finite float".to_string()));
            }
            let bits = (*v as f32).to_bits();
            vec![(bits >> 16) as u16, bits as u16]
        }
        (ValueType::String, RegisterValue::Text(text)) => {
            let capacity = reg.effective_length() as usize * 2;
            if text.len() > capacity {
                return Err(reject(format!(
                    "string of {} bytes exceeds register capacity {}",
                    text.len(),
                    capacity
                )));
            }
            let mut bytes = text.as_bytes().to_vec();
            bytes.resize(capacity, 0);
            bytes
                .chunks_exact(2)
                .map(|pair| ((pair[0] as u16) << 8) | pair[1] as u16)
                .collect()
        }
        (_, RegisterValue::NotImplemented) => {
            return Err(reject("cannot write the not-implemented sentinel".to_string()));
        }
        (value_type, value) => {
            return Err(reject(format!(
                "value {:?} does not match register type {:?}",
                value, value_type
            )));
        }
    };

    Ok(words)
}

/// Effective value of a quantity stored as a value register paired with a
/// power-of-ten scale register. `None` when either side is absent.
pub fn scaled_value(block: &DecodedBlock, value_id: &str, scale_id: &str) -> Option<f64> {
    let value = block.get(value_id)?.as_f64()?;
    let scale = block.get(scale_id)?.as_i64()?;
    Some(apply_scale(value, scale as i32))
}

pub fn apply_scale(value: f64, scale: i32) -> f64 {
    round2(value * 10f64.powi(scale))
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::catalog::{battery_registers, bundle, inverter_registers};

    fn reg(value_type: ValueType) -> RegisterDescriptor {
        let mut r = RegisterDescriptor::new("test", 100, value_type);
        r.writable = true;
        r
    }

    fn text_reg(length: u16) -> RegisterDescriptor {
        let mut r = RegisterDescriptor::text("test", 100, length);
        r.writable = true;
        r
    }

    #[test]
    fn test_roundtrip_int16() {
        let r = reg(ValueType::Int16);
        for v in [-32767i64, -1, 0, 1, 32767] {
            let words = encode_register(&r, &RegisterValue::Int(v)).unwrap();
            assert_eq!(decode_register(&r, &words).unwrap(), RegisterValue::Int(v));
        }
    }

    #[test]
    fn test_roundtrip_int32() {
        let r = reg(ValueType::Int32);
        for v in [i32::MIN as i64 + 1, -70_000, 0, 70_000, i32::MAX as i64] {
            let words = encode_register(&r, &RegisterValue::Int(v)).unwrap();
            assert_eq!(decode_register(&r, &words).unwrap(), RegisterValue::Int(v));
        }
    }

    #[test]
    fn test_roundtrip_uint64() {
        let r = reg(ValueType::UInt64);
        let v = 0x0001_0002_0003_0004u64;
        let words = encode_register(&r, &RegisterValue::UInt(v)).unwrap();
        assert_eq!(words.len(), 4);
        assert_eq!(decode_register(&r, &words).unwrap(), RegisterValue::UInt(v));
    }

    #[test]
    fn test_roundtrip_float32() {
        let r = reg(ValueType::Float32);
        for v in [0.0f64, 1.5, -273.25, 5000.0] {
            let words = encode_register(&r, &RegisterValue::Float(v)).unwrap();
            assert_eq!(decode_register(&r, &words).unwrap(), RegisterValue::Float(v));
        }
    }

    #[test]
    fn test_roundtrip_string() {
        let r = text_reg(8);
        let words = encode_register(&r, &RegisterValue::Text("SolarEdge".to_string())).unwrap();
        assert_eq!(words.len(), 8);
        assert_eq!(
            decode_register(&r, &words).unwrap(),
            RegisterValue::Text("SolarEdge".to_string())
        );
    }

    #[test]
    fn test_sentinels_decode_to_not_implemented() {
        assert_eq!(
            decode_register(&reg(ValueType::Int16), &[0x8000]).unwrap(),
            RegisterValue::NotImplemented
        );
        assert_eq!(
            decode_register(&reg(ValueType::UInt16), &[0xFFFF]).unwrap(),
            RegisterValue::NotImplemented
        );
        assert_eq!(
            decode_register(&reg(ValueType::UInt32), &[0xFFFF, 0xFFFF]).unwrap(),
            RegisterValue::NotImplemented
        );
        assert_eq!(
            decode_register(&reg(ValueType::UInt64), &[0xFFFF; 4]).unwrap(),
            RegisterValue::NotImplemented
        );
        // NaN float
        assert_eq!(
            decode_register(&reg(ValueType::Float32), &[0x7FC0, 0x0000]).unwrap(),
            RegisterValue::NotImplemented
        );
    }

    #[test]
    fn test_invalid_utf8_is_a_typed_fault() {
        let r = text_reg(2);
        let err = decode_register(&r, &[0xFFFE, 0xFDFC]).unwrap_err();
        match err {
            BridgeError::DecodeError { register, address, words, .. } => {
                assert_eq!(register, "test");
                assert_eq!(address, 100);
                assert_eq!(words, vec![0xFFFE, 0xFDFC]);
            }
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_string_trims_trailing_nul_and_whitespace() {
        let r = text_reg(4);
        // "SE1 \0\0\0\0"
        let words = [0x5345, 0x3120, 0x0000, 0x0000];
        assert_eq!(
            decode_register(&r, &words).unwrap(),
            RegisterValue::Text("SE1".to_string())
        );
    }

    #[test]
    fn test_encode_rejects_non_writable() {
        let r = RegisterDescriptor::new("ro", 1, ValueType::UInt16);
        assert!(encode_register(&r, &RegisterValue::UInt(1)).is_err());
    }

    #[test]
    fn test_encode_rejects_out_of_domain() {
        assert!(encode_register(&reg(ValueType::Int16), &RegisterValue::Int(40_000)).is_err());
        assert!(encode_register(&reg(ValueType::UInt16), &RegisterValue::UInt(0x1_0000)).is_err());
        assert!(encode_register(&reg(ValueType::Float32), &RegisterValue::Float(f64::NAN)).is_err());
        assert!(
            encode_register(&text_reg(2), &RegisterValue::Text("too long here".to_string()))
                .is_err()
        );
    }

    #[test]
    fn test_decode_bundle_skips_gaps() {
        // Inverter window: temp_sink at 40103 is followed by a gap before
        // temp_sf at 40106.
        let bundles = bundle(&inverter_registers());
        let b = &bundles[0];
        let mut words = vec![0u16; b.word_count() as usize];

        let start = b.start_address() as usize;
        words[40103 - start] = 47;
        words[40104 - start] = 0xDEAD; // gap, must be discarded
        words[40105 - start] = 0xBEEF; // gap, must be discarded
        words[40106 - start] = 0xFFFF; // -1 as i16

        let decoded = decode_bundle(b, &words).unwrap();
        assert_eq!(decoded["temp_sink"], RegisterValue::Int(47));
        assert_eq!(decoded["temp_sf"], RegisterValue::Int(-1));
    }

    #[test]
    fn test_decode_bundle_rejects_short_block() {
        let bundles = bundle(&battery_registers(0));
        let words = vec![0u16; 3];
        assert!(decode_bundle(&bundles[0], &words).is_err());
    }

    #[test]
    fn test_apply_scale() {
        assert_eq!(apply_scale(1069.0, -1), 106.9);
        assert_eq!(apply_scale(47.0, 2), 4700.0);
        assert_eq!(apply_scale(12345.0, -3), 12.35);
        assert_eq!(apply_scale(500.0, 0), 500.0);
    }

    #[test]
    fn test_scaled_value_absent_when_not_implemented() {
        let mut block = DecodedBlock::new();
        block.insert("ac_power", RegisterValue::NotImplemented);
        block.insert("ac_power_sf", RegisterValue::Int(0));
        assert_eq!(scaled_value(&block, "ac_power", "ac_power_sf"), None);

        block.insert("ac_power", RegisterValue::Int(1500));
        assert_eq!(scaled_value(&block, "ac_power", "ac_power_sf"), Some(1500.0));
    }
}
