//! Flatten nested snapshot/powerflow records into the key -> value mapping
//! the persistence collaborator expects.

use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::utils::error::BridgeError;

/// Flatten any serializable record into numeric fields. Nested record names
/// are joined with `_`, integers and booleans are widened to float, strings
/// and nulls are dropped (identity goes into tags, not fields).
pub fn flatten_fields<T: Serialize>(record: &T) -> Result<BTreeMap<String, f64>, BridgeError> {
    let value = serde_json::to_value(record)?;
    let mut fields = BTreeMap::new();
    walk(&value, String::new(), &mut fields);
    Ok(fields)
}

fn walk(value: &Value, prefix: String, fields: &mut BTreeMap<String, f64>) {
    match value {
        Value::Object(map) => {
            for (key, nested) in map {
                let joined = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}_{}", prefix, key)
                };
                walk(nested, joined, fields);
            }
        }
        Value::Array(items) => {
            for (index, nested) in items.iter().enumerate() {
                walk(nested, format!("{}_{}", prefix, index), fields);
            }
        }
        Value::Number(number) => {
            if let Some(v) = number.as_f64() {
                fields.insert(prefix, v);
            }
        }
        Value::Bool(flag) => {
            fields.insert(prefix, if *flag { 1.0 } else { 0.0 });
        }
        Value::String(_) | Value::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::snapshots::{UnitIdentity, UnitRole};
    use crate::powerflow::{BatteryFlow, ConsumerFlow, GridFlow, InverterFlow, Powerflow};
    use chrono::Utc;

    #[test]
    fn test_flatten_powerflow_joins_with_underscore() {
        let flow = Powerflow {
            unit: UnitIdentity { index: 0, role: UnitRole::Leader, key: "leader".to_string() },
            timestamp: Utc::now(),
            inverter: InverterFlow {
                power: 1000.0,
                consumption: 0.0,
                production: 1000.0,
                pv_production: 833.0,
                battery_production: 167.0,
            },
            grid: GridFlow { power: -500.0, consumption: 500.0, delivery: 0.0 },
            battery: BatteryFlow { power: -200.0, charge: 0.0, discharge: 200.0 },
            consumer: ConsumerFlow::default(),
            suspect: false,
        };

        let fields = flatten_fields(&flow).unwrap();
        assert_eq!(fields["inverter_pv_production"], 833.0);
        assert_eq!(fields["grid_consumption"], 500.0);
        assert_eq!(fields["battery_discharge"], 200.0);
        assert_eq!(fields["suspect"], 0.0);
        // Identity strings and timestamps are not numeric fields
        assert!(!fields.contains_key("unit_key"));
        assert!(!fields.contains_key("timestamp"));
        // The role index still flattens as a number
        assert_eq!(fields["unit_index"], 0.0);
    }

    #[test]
    fn test_flatten_widens_integers() {
        #[derive(Serialize)]
        struct Sample {
            count: u64,
            nested: Nested,
        }

        #[derive(Serialize)]
        struct Nested {
            value: i32,
        }

        let fields = flatten_fields(&Sample { count: 7, nested: Nested { value: -3 } }).unwrap();
        assert_eq!(fields["count"], 7.0);
        assert_eq!(fields["nested_value"], -3.0);
    }
}
