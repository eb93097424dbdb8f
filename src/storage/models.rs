use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::collections::BTreeMap;

/// One named, tagged, timestamped set of numeric fields. The unit of
/// persistence: every poll cycle hands the store a batch of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSet {
    pub measurement: String,
    pub tags: BTreeMap<String, String>,
    pub fields: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl FieldSet {
    pub fn new(measurement: &str, timestamp: DateTime<Utc>) -> Self {
        Self {
            measurement: measurement.to_string(),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
            timestamp,
        }
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_fields(mut self, fields: BTreeMap<String, f64>) -> Self {
        self.fields.extend(fields);
        self
    }

    /// Timestamp in the ISO-8601 form rows are stored with.
    pub fn iso_timestamp(&self) -> String {
        self.timestamp.to_rfc3339()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MeasurementRow {
    pub id: i64,
    pub measurement: String,
    pub tags: String,
    pub fields: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub total_rows: i64,
    pub earliest_timestamp: Option<String>,
    pub latest_timestamp: Option<String>,
}
