//! Home Assistant MQTT discovery payloads.
//!
//! Each published field gets a retained config message under a stable
//! per-field path derived from the topic prefix and the field name.

use serde::Serialize;

use crate::devices::DeviceIdentity;
use crate::utils::error::BridgeError;

use super::mqtt::{availability_topic, MqttPublisher};

const MQTT_DISCOVERY_TOPIC: &str = "homeassistant";

#[derive(Serialize, Debug, Clone)]
pub struct AvailabilityPayload {
    pub topic: String,
}

#[derive(Serialize, Debug, Default, Clone)]
pub struct DevicePayload {
    pub name: String,
    pub identifiers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sw_version: Option<String>,
}

#[derive(Serialize, Debug, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum StateClass {
    Measurement,
    Total,
    TotalIncreasing,
}

#[derive(Serialize, Debug, Copy, Clone)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Battery,
    Current,
    Energy,
    Frequency,
    Power,
    Temperature,
    Voltage,
}

#[derive(Serialize, Debug, Clone)]
pub struct ConfigPayload {
    pub name: String,
    pub unique_id: String,
    pub availability: Vec<AvailabilityPayload>,
    pub device: DevicePayload,
    #[serde(skip)]
    pub config_topic: String,
    pub state_topic: String,
    pub state_class: StateClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measurement: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
}

struct SensorSpec {
    field: &'static str,
    template: &'static str,
    device_class: Option<DeviceClass>,
    state_class: StateClass,
    unit: Option<&'static str>,
}

const fn power_sensor(field: &'static str, template: &'static str) -> SensorSpec {
    SensorSpec {
        field,
        template,
        device_class: Some(DeviceClass::Power),
        state_class: StateClass::Measurement,
        unit: Some("W"),
    }
}

fn bridge_device(topic_prefix: &str) -> DevicePayload {
    DevicePayload {
        name: "Solar Bridge".to_string(),
        identifiers: vec![topic_prefix.to_string()],
        manufacturer: None,
        model: None,
        sw_version: Some(crate::VERSION.to_string()),
    }
}

fn sensor_payload(
    topic_prefix: &str,
    group: &str,
    state_topic: String,
    device: DevicePayload,
    spec: &SensorSpec,
) -> ConfigPayload {
    let unique_id = format!("{}_{}_{}", topic_prefix, group, spec.field);

    ConfigPayload {
        config_topic: format!("{}/sensor/{}/config", MQTT_DISCOVERY_TOPIC, unique_id),
        name: format!("{} {}", group, spec.field.replace('_', " ")),
        unique_id,
        availability: vec![AvailabilityPayload { topic: availability_topic(topic_prefix) }],
        device,
        state_topic,
        state_class: spec.state_class,
        unit_of_measurement: spec.unit.map(str::to_string),
        value_template: Some(spec.template.to_string()),
        device_class: spec.device_class,
    }
}

/// Sensors for the cumulated powerflow topic.
pub fn powerflow_sensors(topic_prefix: &str) -> Vec<ConfigPayload> {
    let specs = [
        power_sensor("pv_production", "{{ value_json.inverter.pv_production }}"),
        power_sensor("battery_production", "{{ value_json.inverter.battery_production }}"),
        power_sensor("production", "{{ value_json.inverter.production }}"),
        power_sensor("inverter_consumption", "{{ value_json.inverter.consumption }}"),
        power_sensor("grid_delivery", "{{ value_json.grid.delivery }}"),
        power_sensor("grid_consumption", "{{ value_json.grid.consumption }}"),
        power_sensor("battery_charge", "{{ value_json.battery.charge }}"),
        power_sensor("battery_discharge", "{{ value_json.battery.discharge }}"),
        power_sensor("house_consumption", "{{ value_json.consumer.house }}"),
        power_sensor("ev_charger", "{{ value_json.consumer.ev_charger }}"),
        power_sensor("total_consumption", "{{ value_json.consumer.total }}"),
    ];

    let state_topic = format!("{}/powerflow", topic_prefix);
    specs
        .iter()
        .map(|spec| {
            sensor_payload(
                topic_prefix,
                "powerflow",
                state_topic.clone(),
                bridge_device(topic_prefix),
                spec,
            )
        })
        .collect()
}

fn snapshot_device(identity: &DeviceIdentity, name: String) -> DevicePayload {
    DevicePayload {
        name,
        identifiers: vec![identity.serialnumber.clone()],
        manufacturer: Some(identity.manufacturer.clone()),
        model: Some(identity.model.clone()),
        sw_version: Some(identity.version.clone()),
    }
}

/// Sensors for one unit's inverter snapshot topic.
pub fn inverter_sensors(
    topic_prefix: &str,
    unit_key: &str,
    identity: &DeviceIdentity,
) -> Vec<ConfigPayload> {
    let specs = [
        power_sensor("ac_power", "{{ value_json.ac_power }}"),
        power_sensor("dc_power", "{{ value_json.dc_power }}"),
        SensorSpec {
            field: "ac_voltage",
            template: "{{ value_json.ac_voltage }}",
            device_class: Some(DeviceClass::Voltage),
            state_class: StateClass::Measurement,
            unit: Some("V"),
        },
        SensorSpec {
            field: "ac_frequency",
            template: "{{ value_json.ac_frequency }}",
            device_class: Some(DeviceClass::Frequency),
            state_class: StateClass::Measurement,
            unit: Some("Hz"),
        },
        SensorSpec {
            field: "ac_energy_total",
            template: "{{ value_json.ac_energy_total }}",
            device_class: Some(DeviceClass::Energy),
            state_class: StateClass::TotalIncreasing,
            unit: Some("Wh"),
        },
        SensorSpec {
            field: "temperature",
            template: "{{ value_json.temperature }}",
            device_class: Some(DeviceClass::Temperature),
            state_class: StateClass::Measurement,
            unit: Some("°C"),
        },
    ];

    let state_topic = format!("{}/{}/inverter", topic_prefix, unit_key);
    let device = snapshot_device(identity, format!("Inverter {}", unit_key));

    specs
        .iter()
        .map(|spec| {
            sensor_payload(
                topic_prefix,
                &format!("{}_inverter", unit_key),
                state_topic.clone(),
                device.clone(),
                spec,
            )
        })
        .collect()
}

/// Sensors for one battery slot of a unit.
pub fn battery_sensors(
    topic_prefix: &str,
    unit_key: &str,
    slot: usize,
    identity: &DeviceIdentity,
) -> Vec<ConfigPayload> {
    let specs = [
        SensorSpec {
            field: "state_of_charge",
            template: "{{ value_json.state_of_charge }}",
            device_class: Some(DeviceClass::Battery),
            state_class: StateClass::Measurement,
            unit: Some("%"),
        },
        SensorSpec {
            field: "state_of_health",
            template: "{{ value_json.state_of_health }}",
            device_class: None,
            state_class: StateClass::Measurement,
            unit: Some("%"),
        },
        power_sensor("instantaneous_power", "{{ value_json.instantaneous_power }}"),
        SensorSpec {
            field: "available_energy",
            template: "{{ value_json.available_energy }}",
            device_class: Some(DeviceClass::Energy),
            state_class: StateClass::Measurement,
            unit: Some("Wh"),
        },
    ];

    let state_topic = format!("{}/{}/battery/{}", topic_prefix, unit_key, slot);
    let device = snapshot_device(identity, format!("Battery {} {}", unit_key, slot));

    specs
        .iter()
        .map(|spec| {
            sensor_payload(
                topic_prefix,
                &format!("{}_battery_{}", unit_key, slot),
                state_topic.clone(),
                device.clone(),
                spec,
            )
        })
        .collect()
}

/// Publish retained discovery configs. Idempotent; re-announced
/// periodically so a restarted broker or Home Assistant picks them up.
pub async fn register_sensors(
    publisher: &MqttPublisher,
    payloads: &[ConfigPayload],
) -> Result<(), BridgeError> {
    for payload in payloads {
        publisher.publish(&payload.config_topic, payload, true).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_powerflow_sensor_paths_are_stable() {
        let sensors = powerflow_sensors("solar");

        let pv = sensors.iter().find(|s| s.unique_id == "solar_powerflow_pv_production").unwrap();
        assert_eq!(pv.config_topic, "homeassistant/sensor/solar_powerflow_pv_production/config");
        assert_eq!(pv.state_topic, "solar/powerflow");
        assert_eq!(
            pv.value_template.as_deref(),
            Some("{{ value_json.inverter.pv_production }}")
        );
        assert_eq!(pv.availability[0].topic, "solar/bridge/state");
    }

    #[test]
    fn test_unique_ids_are_distinct() {
        let identity = DeviceIdentity {
            manufacturer: "SolarEdge".to_string(),
            model: "SE10K".to_string(),
            option: None,
            version: "1".to_string(),
            serialnumber: "7E1".to_string(),
            device_address: 1,
            sunspec_did: 103,
        };

        let mut ids: Vec<String> = powerflow_sensors("solar")
            .into_iter()
            .chain(inverter_sensors("solar", "leader", &identity))
            .chain(battery_sensors("solar", "leader", 0, &identity))
            .map(|s| s.unique_id)
            .collect();

        let total = ids.len();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), total);
    }

    #[test]
    fn test_config_topic_not_serialized_into_payload() {
        let sensors = powerflow_sensors("solar");
        let json = serde_json::to_value(&sensors[0]).unwrap();
        assert!(json.get("config_topic").is_none());
        assert!(json.get("state_topic").is_some());
    }
}
