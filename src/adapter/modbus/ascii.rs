//! MODBUS ASCII framing: `:` + hex(unit-id + PDU + LRC) + CRLF. Shares the
//! serial bus with RTU and SCPI-serial devices through the arbiter.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::adapter::modbus::ModbusTransport;
use crate::arbiter::SerialArbiter;
use crate::config::{SerialParity, SerialStopBits};
use crate::error::{Error, Result};

/// Two's complement of the 8-bit sum of `data`.
pub fn lrc(data: &[u8]) -> u8 {
    let sum: u8 = data.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    (!sum).wrapping_add(1)
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02X}")).collect()
}

fn hex_decode(text: &str) -> Result<Vec<u8>> {
    if !text.len().is_multiple_of(2) {
        return Err(Error::Decode("MODBUS ASCII frame has odd hex length".into()));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).map_err(|e| Error::Decode(format!("invalid hex in ASCII frame: {e}"))))
        .collect()
}

pub struct ModbusAsciiTransport {
    port: String,
    baud: u32,
    parity: SerialParity,
    stopbits: SerialStopBits,
    serial: Option<SerialStream>,
    arbiter: Arc<SerialArbiter>,
}
impl ModbusAsciiTransport {
    pub fn new(port: String, baud: u32, parity: SerialParity, stopbits: SerialStopBits, arbiter: Arc<SerialArbiter>) -> Self {
        Self {
            port,
            baud,
            parity,
            stopbits,
            serial: None,
            arbiter,
        }
    }
}

#[async_trait]
impl ModbusTransport for ModbusAsciiTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.serial.is_some() {
            return Ok(());
        }
        let parity = match self.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Odd => tokio_serial::Parity::Odd,
            SerialParity::Even => tokio_serial::Parity::Even,
        };
        let stop_bits = match self.stopbits {
            SerialStopBits::One => tokio_serial::StopBits::One,
            SerialStopBits::Two => tokio_serial::StopBits::Two,
        };
        self.serial = Some(
            tokio_serial::new(&self.port, self.baud)
                .parity(parity)
                .stop_bits(stop_bits)
                .open_native_async()
                .map_err(|e| Error::Unhandled(e.into()))?,
        );
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.serial.take();
        Ok(())
    }

    async fn exchange(&mut self, unit_id: u8, pdu: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>> {
        let _guard = self.arbiter.acquire(&self.port).await?;
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotAcquired);
        };

        let mut body = Vec::with_capacity(pdu.len() + 1);
        body.push(unit_id);
        body.extend_from_slice(pdu);
        let check = lrc(&body);
        body.push(check);

        let mut frame = String::with_capacity(1 + body.len() * 2 + 2);
        frame.push(':');
        frame.push_str(&hex_encode(&body));
        frame.push_str("\r\n");

        let write = serial.write_all(frame.as_bytes());
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout("modbus-ascii write deadline exceeded".into()));
                }
                tokio::time::timeout(deadline - now, write)
                    .await
                    .map_err(|_| Error::Timeout("modbus-ascii write timed out".into()))??;
            }
            None => write.await?,
        }

        let mut reader = BufReader::new(serial);
        let mut line = Vec::new();
        let read_line = reader.read_until(b'\n', &mut line);
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout("modbus-ascii read deadline exceeded".into()));
                }
                tokio::time::timeout(deadline - now, read_line)
                    .await
                    .map_err(|_| Error::Timeout("modbus-ascii read timed out".into()))??;
            }
            None => {
                read_line.await?;
            }
        }

        let text = String::from_utf8_lossy(&line);
        let text = text.trim_start_matches(':').trim_end_matches(['\r', '\n']);
        let decoded = hex_decode(text)?;
        if decoded.len() < 3 {
            return Err(Error::BadResponse("MODBUS ASCII frame too short".into()));
        }
        let (body, lrc_byte) = decoded.split_at(decoded.len() - 1);
        if lrc(body) != lrc_byte[0] {
            return Err(Error::BadResponse("MODBUS ASCII LRC mismatch".into()));
        }
        if body[0] != unit_id {
            return Err(Error::BadResponse(format!(
                "MODBUS ASCII unit-id mismatch: expected {unit_id}, got {}",
                body[0]
            )));
        }
        Ok(body[1..].to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lrc_matches_known_test_vector() {
        assert_eq!(lrc(&[0x01, 0x03, 0x00, 0x64, 0x00, 0x02]), 0x96);
    }

    #[test]
    fn hex_round_trips() {
        let data = vec![0x01, 0x03, 0x00, 0x64];
        assert_eq!(hex_decode(&hex_encode(&data)).unwrap(), data);
    }
}
