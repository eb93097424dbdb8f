use log::info;
use std::sync::Arc;

use crate::modbus::ModbusClientTrait;
use crate::registers::codec::encode_register;
use crate::registers::{storage_control_registers, RegisterDescriptor, RegisterValue};
use crate::utils::error::BridgeError;

/// Write side of the storage control block.
///
/// Writes go through the same exclusive client as the poll loops, so a
/// control command is never interleaved with a register read transaction.
pub struct StorageController {
    client: Arc<dyn ModbusClientTrait>,
    registers: Vec<RegisterDescriptor>,
}

impl StorageController {
    pub fn new(client: Arc<dyn ModbusClientTrait>) -> Self {
        Self {
            client,
            registers: storage_control_registers(),
        }
    }

    pub async fn set_control_mode(&self, mode: u16) -> Result<(), BridgeError> {
        self.write("control_mode", RegisterValue::UInt(mode as u64)).await
    }

    pub async fn set_remote_command_mode(&self, mode: u16) -> Result<(), BridgeError> {
        self.write("remote_command_mode", RegisterValue::UInt(mode as u64)).await
    }

    pub async fn set_remote_limits(
        &self,
        charge_limit: f64,
        discharge_limit: f64,
    ) -> Result<(), BridgeError> {
        if charge_limit < 0.0 || discharge_limit < 0.0 {
            return Err(BridgeError::InvalidData(
                "charge/discharge limits must not be negative".to_string(),
            ));
        }

        self.write("remote_charge_limit", RegisterValue::Float(charge_limit)).await?;
        self.write("remote_discharge_limit", RegisterValue::Float(discharge_limit)).await
    }

    pub async fn set_backup_reserved(&self, percent: f64) -> Result<(), BridgeError> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(BridgeError::InvalidData(format!(
                "backup reserve {} outside 0..100 %",
                percent
            )));
        }
        self.write("backup_reserved", RegisterValue::Float(percent)).await
    }

    async fn write(&self, id: &str, value: RegisterValue) -> Result<(), BridgeError> {
        let reg = self
            .registers
            .iter()
            .find(|r| r.id == id)
            .ok_or_else(|| BridgeError::InvalidData(format!("unknown control register '{}'", id)))?;

        let words = encode_register(reg, &value)?;
        self.client.write_multiple_registers(reg.address, &words).await?;

        info!("⚙️  Storage control '{}' set to {:?}", id, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        writes: Mutex<Vec<(u16, Vec<u16>)>>,
    }

    #[async_trait]
    impl ModbusClientTrait for RecordingClient {
        async fn read_holding_registers(
            &self,
            _start_addr: u16,
            quantity: u16,
        ) -> Result<Vec<u16>, BridgeError> {
            Ok(vec![0; quantity as usize])
        }

        async fn write_single_register(&self, addr: u16, value: u16) -> Result<(), BridgeError> {
            self.writes.lock().unwrap().push((addr, vec![value]));
            Ok(())
        }

        async fn write_multiple_registers(
            &self,
            addr: u16,
            values: &[u16],
        ) -> Result<(), BridgeError> {
            self.writes.lock().unwrap().push((addr, values.to_vec()));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_remote_limits_written_as_float32() {
        let client = Arc::new(RecordingClient::default());
        let controller = StorageController::new(client.clone());

        controller.set_remote_limits(3300.0, 5000.0).await.unwrap();

        let writes = client.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[0].0, 0xE00E);
        assert_eq!(writes[1].0, 0xE010);

        let bits = ((writes[0].1[0] as u32) << 16) | writes[0].1[1] as u32;
        assert_eq!(f32::from_bits(bits), 3300.0);
    }

    #[tokio::test]
    async fn test_rejects_out_of_domain_values() {
        let client = Arc::new(RecordingClient::default());
        let controller = StorageController::new(client.clone());

        assert!(controller.set_remote_limits(-1.0, 0.0).await.is_err());
        assert!(controller.set_backup_reserved(150.0).await.is_err());
        assert!(client.writes.lock().unwrap().is_empty());
    }
}
