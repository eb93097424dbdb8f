pub mod bridge_service;
#[cfg(feature = "sqlite")]
pub mod database_service;
pub mod scheduler;

pub use bridge_service::BridgeService;
#[cfg(feature = "sqlite")]
pub use database_service::DatabaseService;
pub use scheduler::Scheduler;
