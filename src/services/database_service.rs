use async_trait::async_trait;
use chrono::{Duration, Utc};
use log::info;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bus::{BridgeEvent, Subscriber};
use crate::config::DatabaseOutputConfig;
use crate::output::flatten_fields;
use crate::storage::{DatabaseStats, FieldSet, SqliteManager};
use crate::utils::error::BridgeError;

/// Bus subscriber persisting every cycle's records as named, tagged,
/// timestamped field sets. Attached detached, so a slow disk never stalls
/// a publisher.
pub struct DatabaseService {
    manager: Arc<SqliteManager>,
    retention_days: u32,
}

impl DatabaseService {
    pub async fn new(config: &DatabaseOutputConfig) -> Result<Self, BridgeError> {
        let path = if config.database_path.starts_with("sqlite:") {
            config.database_path.clone()
        } else {
            if let Some(parent) = std::path::Path::new(&config.database_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        BridgeError::ConfigError(format!("Failed to create {:?}: {}", parent, e))
                    })?;
                }
            }
            format!("sqlite://{}", config.database_path)
        };

        let manager = SqliteManager::new(&path, config.max_connections).await?;
        Ok(Self {
            manager: Arc::new(manager),
            retention_days: config.retention_days,
        })
    }

    pub fn manager(&self) -> Arc<SqliteManager> {
        self.manager.clone()
    }

    /// Expand one event into the batch of field sets it persists as.
    fn batch_for(event: &BridgeEvent) -> Result<Vec<FieldSet>, BridgeError> {
        let mut batch = Vec::new();

        match event {
            BridgeEvent::UnitSnapshots(snapshots) => {
                let unit = &snapshots.unit;
                batch.push(
                    FieldSet::new("inverter", snapshots.inverter.timestamp)
                        .with_tag("unit", &unit.key)
                        .with_tag("role", &unit.role.to_string())
                        .with_tag("serialnumber", &snapshots.inverter.identity.serialnumber)
                        .with_fields(device_fields(&snapshots.inverter)?),
                );

                for (slot, meter) in &snapshots.meters {
                    batch.push(
                        FieldSet::new("meter", meter.timestamp)
                            .with_tag("unit", &unit.key)
                            .with_tag("slot", &slot.to_string())
                            .with_tag("serialnumber", &meter.identity.serialnumber)
                            .with_fields(device_fields(meter)?),
                    );
                }

                for (slot, battery) in &snapshots.batteries {
                    batch.push(
                        FieldSet::new("battery", battery.timestamp)
                            .with_tag("unit", &unit.key)
                            .with_tag("slot", &slot.to_string())
                            .with_tag("serialnumber", &battery.identity.serialnumber)
                            .with_fields(device_fields(battery)?),
                    );
                }
            }
            BridgeEvent::UnitPowerflow(flow) | BridgeEvent::CumulatedPowerflow(flow) => {
                batch.push(
                    FieldSet::new("powerflow", flow.timestamp)
                        .with_tag("unit", &flow.unit.key)
                        .with_tag("role", &flow.unit.role.to_string())
                        .with_fields(powerflow_fields(flow.as_ref())?),
                );
            }
            BridgeEvent::StorageControl(control) => {
                batch.push(
                    FieldSet::new("storage_control", control.timestamp)
                        .with_fields(flatten_fields(control.as_ref())?),
                );
            }
        }

        Ok(batch)
    }

    /// Prune rows past retention and log what the store holds.
    pub async fn maintenance(&self) -> Result<DatabaseStats, BridgeError> {
        let cutoff = (Utc::now() - Duration::days(self.retention_days as i64)).to_rfc3339();
        self.manager.prune_older_than(&cutoff).await?;

        let stats = self.manager.get_stats().await?;
        info!(
            "🗄️  Measurement store: {} row(s), span {:?} .. {:?}",
            stats.total_rows, stats.earliest_timestamp, stats.latest_timestamp
        );
        Ok(stats)
    }
}

fn device_fields<T: serde::Serialize>(record: &T) -> Result<BTreeMap<String, f64>, BridgeError> {
    let mut fields = flatten_fields(record)?;
    // Identity goes into tags, not fields
    fields.retain(|key, _| !key.starts_with("identity_"));
    Ok(fields)
}

fn powerflow_fields<T: serde::Serialize>(record: &T) -> Result<BTreeMap<String, f64>, BridgeError> {
    let mut fields = flatten_fields(record)?;
    fields.retain(|key, _| !key.starts_with("unit_"));
    Ok(fields)
}

#[async_trait]
impl Subscriber for DatabaseService {
    fn name(&self) -> &str {
        "database"
    }

    async fn handle(&self, event: BridgeEvent) -> Result<(), BridgeError> {
        let batch = Self::batch_for(&event)?;
        self.manager.store_batch(&batch).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::snapshots::{UnitIdentity, UnitRole};
    use crate::powerflow::{BatteryFlow, ConsumerFlow, GridFlow, InverterFlow, Powerflow};

    fn test_config() -> DatabaseOutputConfig {
        DatabaseOutputConfig {
            enabled: true,
            database_path: "sqlite::memory:".to_string(),
            max_connections: 1,
            retention_days: 30,
        }
    }

    fn flow_event() -> BridgeEvent {
        BridgeEvent::UnitPowerflow(Arc::new(Powerflow {
            unit: UnitIdentity { index: 0, role: UnitRole::Leader, key: "leader".to_string() },
            timestamp: Utc::now(),
            inverter: InverterFlow { pv_production: 833.0, production: 1000.0, ..Default::default() },
            grid: GridFlow::default(),
            battery: BatteryFlow::default(),
            consumer: ConsumerFlow::default(),
            suspect: false,
        }))
    }

    #[tokio::test]
    async fn test_powerflow_event_persists_flattened_fields() {
        let service = DatabaseService::new(&test_config()).await.unwrap();
        service.handle(flow_event()).await.unwrap();

        let rows = service.manager.recent("powerflow", 10).await.unwrap();
        assert_eq!(rows.len(), 1);

        let tags: BTreeMap<String, String> = serde_json::from_str(&rows[0].tags).unwrap();
        assert_eq!(tags["unit"], "leader");
        assert_eq!(tags["role"], "leader");

        let fields: BTreeMap<String, f64> = serde_json::from_str(&rows[0].fields).unwrap();
        assert_eq!(fields["inverter_pv_production"], 833.0);
        assert!(!fields.contains_key("unit_index"));
    }

    #[tokio::test]
    async fn test_maintenance_reports_stats() {
        let service = DatabaseService::new(&test_config()).await.unwrap();
        service.handle(flow_event()).await.unwrap();

        let stats = service.maintenance().await.unwrap();
        assert_eq!(stats.total_rows, 1);
    }
}
