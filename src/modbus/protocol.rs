//! Modbus TCP (MBAP) frame building and parsing.
//!
//! Frames are built as raw byte vectors and validated field by field on the
//! way back in, so a transport fault (short frame, wrong transaction id,
//! exception response) is always distinguishable from successfully read but
//! invalid register data.

use crate::utils::error::BridgeError;

pub const FUNC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FUNC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FUNC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;

/// Maximum registers per read transaction. Register bundles are sized
/// against this limit by the catalog.
pub const MAX_REGISTERS_PER_READ: u16 = 120;

const MBAP_HEADER_LEN: usize = 7;
const PROTOCOL_ID_MODBUS: u16 = 0x0000;

pub fn build_read_holding_registers(
    transaction_id: u16,
    unit_id: u8,
    start_addr: u16,
    quantity: u16,
) -> Vec<u8> {
    let mut frame = mbap_header(transaction_id, unit_id, 5);
    frame.push(FUNC_READ_HOLDING_REGISTERS);
    frame.extend_from_slice(&start_addr.to_be_bytes());
    frame.extend_from_slice(&quantity.to_be_bytes());
    frame
}

pub fn build_write_single_register(
    transaction_id: u16,
    unit_id: u8,
    register_addr: u16,
    value: u16,
) -> Vec<u8> {
    let mut frame = mbap_header(transaction_id, unit_id, 5);
    frame.push(FUNC_WRITE_SINGLE_REGISTER);
    frame.extend_from_slice(&register_addr.to_be_bytes());
    frame.extend_from_slice(&value.to_be_bytes());
    frame
}

pub fn build_write_multiple_registers(
    transaction_id: u16,
    unit_id: u8,
    start_addr: u16,
    values: &[u16],
) -> Vec<u8> {
    let byte_count = (values.len() * 2) as u8;
    let mut frame = mbap_header(transaction_id, unit_id, 6 + byte_count as u16);
    frame.push(FUNC_WRITE_MULTIPLE_REGISTERS);
    frame.extend_from_slice(&start_addr.to_be_bytes());
    frame.extend_from_slice(&(values.len() as u16).to_be_bytes());
    frame.push(byte_count);
    for value in values {
        frame.extend_from_slice(&value.to_be_bytes());
    }
    frame
}

fn mbap_header(transaction_id: u16, unit_id: u8, pdu_len: u16) -> Vec<u8> {
    let mut header = Vec::with_capacity(MBAP_HEADER_LEN + pdu_len as usize);
    header.extend_from_slice(&transaction_id.to_be_bytes());
    header.extend_from_slice(&PROTOCOL_ID_MODBUS.to_be_bytes());
    // Length field counts the unit id plus the PDU
    header.extend_from_slice(&(pdu_len + 1).to_be_bytes());
    header.push(unit_id);
    header
}

/// Length of the PDU announced by an MBAP header, excluding the unit id.
pub fn pdu_length_from_header(header: &[u8; MBAP_HEADER_LEN]) -> Result<usize, BridgeError> {
    let protocol_id = u16::from_be_bytes([header[2], header[3]]);
    if protocol_id != PROTOCOL_ID_MODBUS {
        return Err(BridgeError::CommunicationError(format!(
            "Unexpected MBAP protocol id: 0x{:04X}",
            protocol_id
        )));
    }

    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
        return Err(BridgeError::CommunicationError(format!(
            "MBAP length field too small: {}",
            length
        )));
    }
    Ok(length - 1)
}

/// Validate the MBAP envelope and unwrap a read-holding-registers response
/// into register words.
pub fn parse_read_holding_response(
    header: &[u8; MBAP_HEADER_LEN],
    pdu: &[u8],
    expected_transaction_id: u16,
    expected_unit_id: u8,
    expected_quantity: u16,
) -> Result<Vec<u16>, BridgeError> {
    check_envelope(header, pdu, expected_transaction_id, expected_unit_id)?;
    check_function(pdu, FUNC_READ_HOLDING_REGISTERS)?;

    let byte_count = pdu[1] as usize;
    if byte_count != expected_quantity as usize * 2 || pdu.len() < 2 + byte_count {
        return Err(BridgeError::CommunicationError(format!(
            "Unexpected read response size: byte count {}, expected {} registers",
            byte_count, expected_quantity
        )));
    }

    let words = pdu[2..2 + byte_count]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    Ok(words)
}

/// Write responses echo the start address; verify the envelope and echo.
pub fn parse_write_response(
    header: &[u8; MBAP_HEADER_LEN],
    pdu: &[u8],
    expected_transaction_id: u16,
    expected_unit_id: u8,
    expected_function: u8,
    expected_addr: u16,
) -> Result<(), BridgeError> {
    check_envelope(header, pdu, expected_transaction_id, expected_unit_id)?;
    check_function(pdu, expected_function)?;

    if pdu.len() < 5 {
        return Err(BridgeError::CommunicationError(
            "Write response too short".to_string(),
        ));
    }

    let echoed_addr = u16::from_be_bytes([pdu[1], pdu[2]]);
    if echoed_addr != expected_addr {
        return Err(BridgeError::CommunicationError(format!(
            "Write response echoed address {} instead of {}",
            echoed_addr, expected_addr
        )));
    }
    Ok(())
}

fn check_envelope(
    header: &[u8; MBAP_HEADER_LEN],
    pdu: &[u8],
    expected_transaction_id: u16,
    expected_unit_id: u8,
) -> Result<(), BridgeError> {
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    if transaction_id != expected_transaction_id {
        return Err(BridgeError::CommunicationError(format!(
            "Transaction id mismatch: got {}, expected {}",
            transaction_id, expected_transaction_id
        )));
    }

    if header[6] != expected_unit_id {
        return Err(BridgeError::CommunicationError(format!(
            "Unit id mismatch: got {}, expected {}",
            header[6], expected_unit_id
        )));
    }

    if pdu.is_empty() {
        return Err(BridgeError::CommunicationError("Empty PDU".to_string()));
    }
    Ok(())
}

fn check_function(pdu: &[u8], expected_function: u8) -> Result<(), BridgeError> {
    let function = pdu[0];

    // Exception responses set the high bit of the function code
    if function == expected_function | 0x80 {
        let code = pdu.get(1).copied().unwrap_or(0);
        return Err(BridgeError::ExceptionResponse {
            function: expected_function,
            code,
        });
    }

    if function != expected_function {
        return Err(BridgeError::CommunicationError(format!(
            "Unexpected function code: 0x{:02X}",
            function
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_request_frame() {
        let frame = build_read_holding_registers(0x1234, 1, 40000, 69);
        assert_eq!(frame.len(), 12);
        assert_eq!(&frame[..2], &[0x12, 0x34]);
        assert_eq!(&frame[2..4], &[0x00, 0x00]);
        assert_eq!(&frame[4..6], &[0x00, 0x06]);
        assert_eq!(frame[6], 1);
        assert_eq!(frame[7], FUNC_READ_HOLDING_REGISTERS);
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), 40000);
        assert_eq!(u16::from_be_bytes([frame[10], frame[11]]), 69);
    }

    #[test]
    fn test_read_response_roundtrip() {
        let header: [u8; 7] = [0x12, 0x34, 0x00, 0x00, 0x00, 0x07, 0x01];
        let pdu = vec![FUNC_READ_HOLDING_REGISTERS, 4, 0x01, 0x02, 0x03, 0x04];

        let words = parse_read_holding_response(&header, &pdu, 0x1234, 1, 2).unwrap();
        assert_eq!(words, vec![0x0102, 0x0304]);
    }

    #[test]
    fn test_exception_response() {
        let header: [u8; 7] = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01];
        let pdu = vec![FUNC_READ_HOLDING_REGISTERS | 0x80, 0x02];

        let err = parse_read_holding_response(&header, &pdu, 1, 1, 2).unwrap_err();
        match err {
            BridgeError::ExceptionResponse { function, code } => {
                assert_eq!(function, FUNC_READ_HOLDING_REGISTERS);
                assert_eq!(code, 0x02);
            }
            other => panic!("expected exception response, got {:?}", other),
        }
    }

    #[test]
    fn test_transaction_id_mismatch() {
        let header: [u8; 7] = [0x00, 0x02, 0x00, 0x00, 0x00, 0x05, 0x01];
        let pdu = vec![FUNC_READ_HOLDING_REGISTERS, 2, 0x00, 0x01];

        assert!(parse_read_holding_response(&header, &pdu, 1, 1, 1).is_err());
    }

    #[test]
    fn test_write_multiple_frame() {
        let frame = build_write_multiple_registers(7, 1, 0xE004, &[1, 2]);
        assert_eq!(frame[7], FUNC_WRITE_MULTIPLE_REGISTERS);
        assert_eq!(u16::from_be_bytes([frame[8], frame[9]]), 0xE004);
        assert_eq!(u16::from_be_bytes([frame[10], frame[11]]), 2);
        assert_eq!(frame[12], 4);
        assert_eq!(&frame[13..], &[0x00, 0x01, 0x00, 0x02]);
    }
}
