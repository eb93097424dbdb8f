pub mod controller;
pub mod reader;
pub mod snapshots;

pub use controller::StorageController;
pub use reader::{probe_plan, DeviceReader, ProbePlan, UnitSnapshots};
pub use snapshots::{
    BatteryData, DeviceIdentity, InverterData, InverterStatus, MeterData, StorageControlData,
    UnitIdentity, UnitRole,
};
