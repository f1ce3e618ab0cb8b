//! MBAP framing for read requests. Register values are passed through undecoded.

use crate::group::ModbusGroup;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const MBAP_HEADER_LEN: usize = 7;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("response mismatch: {0}")]
    Mismatch(String),
    #[error("device exception {code} for function {func_code}")]
    Exception { func_code: u8, code: u8 },
}

impl FrameError {
    /// The device answered; the stream itself is still usable
    pub fn is_device_side(&self) -> bool {
        matches!(self, FrameError::Exception { .. })
    }
}

pub fn read_request(transaction: u16, group: &ModbusGroup) -> [u8; 12] {
    let mut frame = [0u8; 12];
    frame[0..2].copy_from_slice(&transaction.to_be_bytes());
    // protocol id stays 0
    frame[4..6].copy_from_slice(&6u16.to_be_bytes());
    frame[6] = group.unit_id;
    frame[7] = group.func_code;
    frame[8..10].copy_from_slice(&group.address.to_be_bytes());
    frame[10..12].copy_from_slice(&group.count.to_be_bytes());
    frame
}

/// Sends one read request and returns the raw data bytes of the response
pub async fn exchange(
    stream: &mut TcpStream,
    transaction: u16,
    group: &ModbusGroup,
    timeout: Duration,
) -> Result<Vec<u8>, FrameError> {
    stream.write_all(&read_request(transaction, group)).await?;
    tokio::time::timeout(timeout, read_response(stream, transaction, group))
        .await
        .map_err(|_| FrameError::Timeout(timeout))?
}

async fn read_response(
    stream: &mut TcpStream,
    transaction: u16,
    group: &ModbusGroup,
) -> Result<Vec<u8>, FrameError> {
    let mut header = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut header).await?;
    let tid = u16::from_be_bytes([header[0], header[1]]);
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if tid != transaction {
        return Err(FrameError::Mismatch(format!(
            "transaction {tid}, expected {transaction}"
        )));
    }
    if length < 2 || length > 254 {
        return Err(FrameError::Mismatch(format!("length {length}")));
    }
    if header[6] != group.unit_id {
        return Err(FrameError::Mismatch(format!("unit {}", header[6])));
    }

    // length counts the unit id already read
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await?;
    let func = pdu[0];
    if func == group.func_code | 0x80 {
        return Err(FrameError::Exception {
            func_code: group.func_code,
            code: pdu.get(1).copied().unwrap_or(0),
        });
    }
    if func != group.func_code {
        return Err(FrameError::Mismatch(format!("function {func}")));
    }
    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    if pdu.len() < 2 + byte_count {
        return Err(FrameError::Mismatch(format!("short payload ({} bytes)", pdu.len())));
    }
    Ok(pdu[2..2 + byte_count].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_layout() {
        let group = ModbusGroup {
            block_id: "b1".into(),
            unit_id: 17,
            func_code: 3,
            address: 0x006B,
            count: 3,
            period: Duration::from_secs(1),
            polled: true,
            tags: 0,
        };
        assert_eq!(
            read_request(1, &group),
            [0x00, 0x01, 0x00, 0x00, 0x00, 0x06, 0x11, 0x03, 0x00, 0x6B, 0x00, 0x03]
        );
    }
}
