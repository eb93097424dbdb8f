use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::devices::{UnitIdentity, UnitRole};
use crate::registers::{BATTERY_SLOTS, METER_SLOTS};
use crate::utils::error::BridgeError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Bridge identification
    pub bridge_uuid: String,
    pub bridge_name: String,
    pub bridge_version: String,

    // Inverter units, leader first by convention
    pub units: Vec<UnitConfig>,

    // Poll cadences
    pub polling: PollingConfig,

    // Output settings
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitConfig {
    pub key: String,
    pub host: String,
    pub port: u16,
    pub unit_id: u8,
    pub timeout_ms: u64,
    pub role: UnitRole,
    /// Meter slots (0-2) to probe on this unit.
    pub meters: Vec<usize>,
    /// Battery slots (0-1) to probe on this unit.
    pub batteries: Vec<usize>,
    /// Relax the PV/grid-delivery consistency check for installs metering
    /// PV outside the inverter's DC input.
    pub external_production: bool,
}

impl UnitConfig {
    pub fn identity(&self, index: usize) -> UnitIdentity {
        UnitIdentity {
            index,
            role: self.role,
            key: self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Device read + powerflow cadence.
    pub base_interval_seconds: u64,
    /// Storage control block cadence.
    pub storage_interval_seconds: u64,
    /// Powerflow summary log cadence.
    pub summary_interval_seconds: u64,
    /// Discovery re-announcement cadence.
    pub discovery_interval_seconds: u64,
    /// Database maintenance cadence.
    pub maintenance_interval_seconds: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_interval_seconds: 5,
            storage_interval_seconds: 60,
            summary_interval_seconds: 300,
            discovery_interval_seconds: 600,
            maintenance_interval_seconds: 900,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputConfig {
    pub mqtt: Option<MqttOutputConfig>,
    pub database: Option<DatabaseOutputConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttOutputConfig {
    pub enabled: bool,
    pub broker: String,
    pub port: u16,
    pub client_id: String,
    pub topic_prefix: String,
    pub qos: u8,
    pub retain: bool,
}

impl Default for MqttOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            broker: "localhost".to_string(),
            port: 1883,
            client_id: "inverter_bridge".to_string(),
            topic_prefix: "solar".to_string(),
            qos: 1,
            retain: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseOutputConfig {
    pub enabled: bool,
    pub database_path: String,
    pub max_connections: u32,
    pub retention_days: u32,
}

impl Default for DatabaseOutputConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            database_path: "data/measurements.db".to_string(),
            max_connections: 5,
            retention_days: 90,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bridge_uuid: Uuid::new_v4().to_string(),
            bridge_name: "Solar Inverter Bridge".to_string(),
            bridge_version: crate::VERSION.to_string(),
            units: vec![UnitConfig {
                key: "leader".to_string(),
                host: "192.168.1.40".to_string(),
                port: 1502,
                unit_id: 1,
                timeout_ms: 2000,
                role: UnitRole::Leader,
                meters: vec![0],
                batteries: vec![],
                external_production: false,
            }],
            polling: PollingConfig::default(),
            output: OutputConfig {
                mqtt: Some(MqttOutputConfig::default()),
                database: Some(DatabaseOutputConfig::default()),
            },
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, BridgeError> {
        let content = std::fs::read_to_string(&path).map_err(|e| {
            BridgeError::ConfigError(format!(
                "Failed to read config file {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;

        let mut config: Config = toml::from_str(&content)
            .map_err(|e| BridgeError::ConfigError(format!("Invalid config file: {}", e)))?;

        // Backward compatibility for configs written before these fields
        if config.bridge_uuid.is_empty() {
            config.bridge_uuid = Uuid::new_v4().to_string();
        }
        if config.bridge_version.is_empty() {
            config.bridge_version = crate::VERSION.to_string();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), BridgeError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| BridgeError::ConfigError(format!("Failed to create {:?}: {}", parent, e)))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| BridgeError::ConfigError(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&path, content).map_err(|e| {
            BridgeError::ConfigError(format!("Failed to write {:?}: {}", path.as_ref(), e))
        })?;
        Ok(())
    }

    /// Command line overrides on top of a loaded or default config.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), BridgeError> {
        if let Some(host) = matches.get_one::<String>("host") {
            let unit = self.units.first_mut().ok_or_else(|| {
                BridgeError::ConfigError("No unit configured to apply --host to".to_string())
            })?;
            unit.host = host.clone();
        }

        if let Some(interval) = matches.get_one::<String>("interval") {
            self.polling.base_interval_seconds = interval
                .parse()
                .map_err(|_| BridgeError::ConfigError(format!("Invalid interval: {}", interval)))?;
        }

        if let Some(broker) = matches.get_one::<String>("broker") {
            let mqtt = self.output.mqtt.get_or_insert_with(MqttOutputConfig::default);
            mqtt.broker = broker.clone();
        }

        self.validate()
    }

    /// Configuration faults are fatal to the affected subsystem's startup.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.units.is_empty() {
            return Err(BridgeError::ConfigError("No units configured".to_string()));
        }

        let leaders = self.units.iter().filter(|u| u.role == UnitRole::Leader).count();
        if leaders != 1 {
            return Err(BridgeError::ConfigError(format!(
                "Exactly one leader unit required, found {}",
                leaders
            )));
        }

        if self.units.iter().any(|u| u.role == UnitRole::Cumulated) {
            return Err(BridgeError::ConfigError(
                "The cumulated unit is synthesized and cannot be configured".to_string(),
            ));
        }

        let mut keys: Vec<&str> = self.units.iter().map(|u| u.key.as_str()).collect();
        keys.sort_unstable();
        keys.dedup();
        if keys.len() != self.units.len() {
            return Err(BridgeError::ConfigError("Unit keys must be unique".to_string()));
        }

        for unit in &self.units {
            if unit.key.is_empty() {
                return Err(BridgeError::ConfigError("Unit key must not be empty".to_string()));
            }
            if let Some(&slot) = unit.meters.iter().find(|&&s| s >= METER_SLOTS) {
                return Err(BridgeError::ConfigError(format!(
                    "Unit '{}': meter slot {} outside 0..{}",
                    unit.key,
                    slot,
                    METER_SLOTS - 1
                )));
            }
            if let Some(&slot) = unit.batteries.iter().find(|&&s| s >= BATTERY_SLOTS) {
                return Err(BridgeError::ConfigError(format!(
                    "Unit '{}': battery slot {} outside 0..{}",
                    unit.key,
                    slot,
                    BATTERY_SLOTS - 1
                )));
            }
        }

        Ok(())
    }

    pub fn leader(&self) -> &UnitConfig {
        // validate() guarantees exactly one
        self.units
            .iter()
            .find(|u| u.role == UnitRole::Leader)
            .expect("validated config has a leader")
    }

    pub fn mqtt_enabled(&self) -> bool {
        self.output.mqtt.as_ref().map(|m| m.enabled).unwrap_or(false)
    }

    pub fn database_enabled(&self) -> bool {
        self.output.database.as_ref().map(|d| d.enabled).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower(key: &str) -> UnitConfig {
        UnitConfig {
            key: key.to_string(),
            host: "192.168.1.41".to_string(),
            port: 1502,
            unit_id: 2,
            timeout_ms: 2000,
            role: UnitRole::Follower,
            meters: vec![],
            batteries: vec![0],
            external_production: false,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.units.push(follower("garage"));

        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();

        assert_eq!(parsed.units.len(), 2);
        assert_eq!(parsed.units[1].key, "garage");
        assert_eq!(parsed.units[1].role, UnitRole::Follower);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn test_exactly_one_leader_required() {
        let mut none = Config::default();
        none.units[0].role = UnitRole::Follower;
        assert!(none.validate().is_err());

        let mut two = Config::default();
        let mut second = follower("second");
        second.role = UnitRole::Leader;
        two.units.push(second);
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_cumulated_unit_cannot_be_configured() {
        let mut config = Config::default();
        let mut synthetic = follower("synthetic");
        synthetic.role = UnitRole::Cumulated;
        config.units.push(synthetic);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_slot_ranges_validated() {
        let mut config = Config::default();
        config.units[0].meters = vec![3];
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.units[0].batteries = vec![2];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut config = Config::default();
        let mut duplicate = follower("leader");
        duplicate.role = UnitRole::Follower;
        config.units.push(duplicate);
        assert!(config.validate().is_err());
    }
}
