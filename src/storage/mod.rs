pub mod models;
pub mod sqlite_manager;

pub use models::{DatabaseStats, FieldSet, MeasurementRow};
pub use sqlite_manager::SqliteManager;
