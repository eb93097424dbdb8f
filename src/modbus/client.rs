use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::protocol;
use crate::utils::error::BridgeError;

#[async_trait]
pub trait ModbusClientTrait: Send + Sync {
    async fn read_holding_registers(
        &self,
        start_addr: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, BridgeError>;

    async fn write_single_register(
        &self,
        register_addr: u16,
        value: u16,
    ) -> Result<(), BridgeError>;

    async fn write_multiple_registers(
        &self,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), BridgeError>;
}

/// Modbus TCP client for one inverter unit.
///
/// The connection is exclusive: every transaction takes the connection lock
/// for its full request/response round trip, so a controller write is never
/// interleaved with a poll transaction. A transport fault drops the
/// connection; the next transaction reconnects.
pub struct ModbusTcpClient {
    host: String,
    port: u16,
    unit_id: u8,
    response_timeout: Duration,
    stream: Mutex<Option<TcpStream>>,
    transaction_id: AtomicU16,
}

impl ModbusTcpClient {
    pub fn new(host: &str, port: u16, unit_id: u8, timeout_ms: u64) -> Self {
        Self {
            host: host.to_string(),
            port,
            unit_id,
            response_timeout: Duration::from_millis(timeout_ms),
            stream: Mutex::new(None),
            transaction_id: AtomicU16::new(1),
        }
    }

    fn next_transaction_id(&self) -> u16 {
        self.transaction_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn connect(&self) -> Result<TcpStream, BridgeError> {
        info!("🔌 Connecting to Modbus TCP {}:{} (unit {})", self.host, self.port, self.unit_id);

        let stream = timeout(
            self.response_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| BridgeError::Timeout)?
        .map_err(|e| {
            BridgeError::ConnectionError(format!(
                "Failed to connect to {}:{}: {}",
                self.host, self.port, e
            ))
        })?;

        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Run one request/response transaction under the connection lock.
    async fn transact(&self, request: &[u8]) -> Result<([u8; 7], Vec<u8>), BridgeError> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            *guard = Some(self.connect().await?);
        }
        let stream = guard.as_mut().unwrap();

        let result = self.exchange(stream, request).await;
        if result.is_err() {
            // Force a reconnect on the next transaction
            *guard = None;
        }
        result
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        request: &[u8],
    ) -> Result<([u8; 7], Vec<u8>), BridgeError> {
        timeout(self.response_timeout, stream.write_all(request)).await??;

        let mut header = [0u8; 7];
        timeout(self.response_timeout, stream.read_exact(&mut header)).await??;

        let pdu_len = protocol::pdu_length_from_header(&header)?;
        let mut pdu = vec![0u8; pdu_len];
        timeout(self.response_timeout, stream.read_exact(&mut pdu)).await??;

        Ok((header, pdu))
    }
}

#[async_trait]
impl ModbusClientTrait for ModbusTcpClient {
    async fn read_holding_registers(
        &self,
        start_addr: u16,
        quantity: u16,
    ) -> Result<Vec<u16>, BridgeError> {
        if quantity == 0 || quantity > protocol::MAX_REGISTERS_PER_READ {
            return Err(BridgeError::InvalidData(format!(
                "Invalid register quantity: {}",
                quantity
            )));
        }

        debug!(
            "📊 Reading {} registers from unit {} starting at {}",
            quantity, self.unit_id, start_addr
        );

        let tid = self.next_transaction_id();
        let request = protocol::build_read_holding_registers(tid, self.unit_id, start_addr, quantity);
        let (header, pdu) = self.transact(&request).await?;

        protocol::parse_read_holding_response(&header, &pdu, tid, self.unit_id, quantity)
    }

    async fn write_single_register(
        &self,
        register_addr: u16,
        value: u16,
    ) -> Result<(), BridgeError> {
        let tid = self.next_transaction_id();
        let request = protocol::build_write_single_register(tid, self.unit_id, register_addr, value);
        let (header, pdu) = self.transact(&request).await?;

        protocol::parse_write_response(
            &header,
            &pdu,
            tid,
            self.unit_id,
            protocol::FUNC_WRITE_SINGLE_REGISTER,
            register_addr,
        )?;

        info!("✅ Wrote register {} on unit {}", register_addr, self.unit_id);
        Ok(())
    }

    async fn write_multiple_registers(
        &self,
        start_addr: u16,
        values: &[u16],
    ) -> Result<(), BridgeError> {
        if values.is_empty() {
            warn!("⚠️  Ignoring empty register write at {}", start_addr);
            return Ok(());
        }

        let tid = self.next_transaction_id();
        let request =
            protocol::build_write_multiple_registers(tid, self.unit_id, start_addr, values);
        let (header, pdu) = self.transact(&request).await?;

        protocol::parse_write_response(
            &header,
            &pdu,
            tid,
            self.unit_id,
            protocol::FUNC_WRITE_MULTIPLE_REGISTERS,
            start_addr,
        )?;

        info!(
            "✅ Wrote {} registers at {} on unit {}",
            values.len(),
            start_addr,
            self.unit_id
        );
        Ok(())
    }
}
