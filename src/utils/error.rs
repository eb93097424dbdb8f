use thiserror::Error;

/// Error taxonomy for the bridge.
///
/// Transport and protocol errors carry raw register context and are retried
/// on the next poll tick. Validity and configuration errors carry
/// human-readable messages; an invalid powerflow is never published.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Communication error: {0}")]
    CommunicationError(String),

    #[error("Timeout occurred")]
    Timeout,

    #[error("Modbus exception: function 0x{function:02X}, code 0x{code:02X}")]
    ExceptionResponse { function: u8, code: u8 },

    #[error("Decode error for register '{register}' at address {address}: {cause} (raw words: {words:?})")]
    DecodeError {
        register: &'static str,
        address: u16,
        words: Vec<u16>,
        cause: String,
    },

    #[error("Encode error for register '{register}': {cause}")]
    EncodeError {
        register: &'static str,
        cause: String,
    },

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Data validity error: {0}")]
    InvalidPowerflow(String),

    #[error("Required device missing: {0}")]
    DeviceMissing(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl BridgeError {
    /// Recoverable errors are caught by the owning poll loop, logged, and
    /// retried on the next tick. Configuration errors are fatal to the
    /// affected subsystem's startup.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, BridgeError::ConfigError(_))
    }
}

impl From<std::io::Error> for BridgeError {
    fn from(err: std::io::Error) -> Self {
        BridgeError::CommunicationError(format!("IO error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for BridgeError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        BridgeError::Timeout
    }
}

impl From<serde_json::Error> for BridgeError {
    fn from(err: serde_json::Error) -> Self {
        BridgeError::SerializationError(format!("JSON error: {}", err))
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for BridgeError {
    fn from(err: sqlx::Error) -> Self {
        BridgeError::CommunicationError(format!("Database error: {}", err))
    }
}
