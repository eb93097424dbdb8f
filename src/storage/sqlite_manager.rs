use log::{debug, info};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

use crate::utils::error::BridgeError;

use super::models::{DatabaseStats, FieldSet, MeasurementRow};

/// SQLite-backed measurement store.
///
/// Rows are append-only: measurement name, JSON tags, JSON fields and an
/// ISO-8601 timestamp. Maintenance prunes rows past the retention window.
pub struct SqliteManager {
    pool: SqlitePool,
}

impl SqliteManager {
    pub async fn new(database_path: &str, max_connections: u32) -> Result<Self, BridgeError> {
        info!("🗄️  Opening measurement database at {}", database_path);

        let options = SqliteConnectOptions::from_str(database_path)
            .map_err(|e| BridgeError::ConfigError(format!("Invalid database path: {}", e)))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let manager = Self { pool };
        manager.migrate().await?;
        Ok(manager)
    }

    async fn migrate(&self) -> Result<(), BridgeError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS measurements (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                measurement TEXT NOT NULL,
                tags TEXT NOT NULL,
                fields TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_measurements_name_ts
             ON measurements (measurement, timestamp)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn store_batch(&self, batch: &[FieldSet]) -> Result<(), BridgeError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        for field_set in batch {
            sqlx::query(
                "INSERT INTO measurements (measurement, tags, fields, timestamp)
                 VALUES (?, ?, ?, ?)",
            )
            .bind(&field_set.measurement)
            .bind(serde_json::to_string(&field_set.tags)?)
            .bind(serde_json::to_string(&field_set.fields)?)
            .bind(field_set.iso_timestamp())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        debug!("💾 Stored {} field set(s)", batch.len());
        Ok(())
    }

    pub async fn get_stats(&self) -> Result<DatabaseStats, BridgeError> {
        let row = sqlx::query(
            "SELECT COUNT(*), MIN(timestamp), MAX(timestamp) FROM measurements",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(DatabaseStats {
            total_rows: row.get(0),
            earliest_timestamp: row.get(1),
            latest_timestamp: row.get(2),
        })
    }

    pub async fn recent(
        &self,
        measurement: &str,
        limit: i64,
    ) -> Result<Vec<MeasurementRow>, BridgeError> {
        let rows = sqlx::query_as::<_, MeasurementRow>(
            "SELECT id, measurement, tags, fields, timestamp FROM measurements
             WHERE measurement = ? ORDER BY timestamp DESC LIMIT ?",
        )
        .bind(measurement)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Delete rows older than the retention window; returns how many went.
    pub async fn prune_older_than(&self, cutoff_iso: &str) -> Result<u64, BridgeError> {
        let result = sqlx::query("DELETE FROM measurements WHERE timestamp < ?")
            .bind(cutoff_iso)
            .execute(&self.pool)
            .await?;

        let pruned = result.rows_affected();
        if pruned > 0 {
            info!("🧹 Pruned {} measurement row(s) older than {}", pruned, cutoff_iso);
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use std::collections::BTreeMap;

    async fn manager() -> SqliteManager {
        SqliteManager::new("sqlite::memory:", 1).await.unwrap()
    }

    fn sample(measurement: &str, offset_minutes: i64) -> FieldSet {
        let mut fields = BTreeMap::new();
        fields.insert("inverter_pv_production".to_string(), 833.0);
        fields.insert("grid_consumption".to_string(), 0.0);

        FieldSet::new(measurement, Utc::now() - Duration::minutes(offset_minutes))
            .with_tag("unit", "leader")
            .with_fields(fields)
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let manager = manager().await;
        manager
            .store_batch(&[sample("powerflow", 0), sample("inverter", 0)])
            .await
            .unwrap();

        let rows = manager.recent("powerflow", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].measurement, "powerflow");

        let tags: BTreeMap<String, String> = serde_json::from_str(&rows[0].tags).unwrap();
        assert_eq!(tags["unit"], "leader");

        let fields: BTreeMap<String, f64> = serde_json::from_str(&rows[0].fields).unwrap();
        assert_eq!(fields["inverter_pv_production"], 833.0);
    }

    #[tokio::test]
    async fn test_stats_and_prune() {
        let manager = manager().await;
        manager
            .store_batch(&[sample("powerflow", 60), sample("powerflow", 0)])
            .await
            .unwrap();

        let stats = manager.get_stats().await.unwrap();
        assert_eq!(stats.total_rows, 2);
        assert!(stats.earliest_timestamp.is_some());

        let cutoff = (Utc::now() - Duration::minutes(30)).to_rfc3339();
        let pruned = manager.prune_older_than(&cutoff).await.unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(manager.get_stats().await.unwrap().total_rows, 1);
    }

    #[tokio::test]
    async fn test_empty_batch_is_a_no_op() {
        let manager = manager().await;
        manager.store_batch(&[]).await.unwrap();
        assert_eq!(manager.get_stats().await.unwrap().total_rows, 0);
    }
}
