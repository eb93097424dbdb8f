pub mod settings;

pub use settings::{
    Config, DatabaseOutputConfig, MqttOutputConfig, OutputConfig, PollingConfig, UnitConfig,
};
