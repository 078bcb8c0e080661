//! MODBUS RTU framing: unit-id + PDU + CRC-16 (poly 0xA001, init 0xFFFF,
//! little-endian on the wire), serialized on the shared serial bus and
//! separated by inter-frame silence.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use crc::{Crc, CRC_16_MODBUS};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::adapter::modbus::ModbusTransport;
use crate::arbiter::SerialArbiter;
use crate::config::{SerialParity, SerialStopBits};
use crate::error::{Error, Result};

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Minimum silence, in character times, required before a frame and to
/// detect the end of one (1.75 character times after the last byte).
fn char_time(baud: u32) -> Duration {
    // 11 bits/char (start + 8 data + parity + stop, worst case) is the
    // conservative figure the MODBUS serial line spec uses for timing.
    Duration::from_secs_f64(11.0 / baud as f64)
}

pub struct ModbusRtuTransport {
    port: String,
    baud: u32,
    parity: SerialParity,
    stopbits: SerialStopBits,
    serial: Option<SerialStream>,
    arbiter: Arc<SerialArbiter>,
}
impl ModbusRtuTransport {
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

    fn inter_frame_timeout(&self) -> Duration {
        char_time(self.baud).mul_f64(1.75).max(Duration::from_millis(2))
    }
}

#[async_trait]
impl ModbusTransport for ModbusRtuTransport {
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

        let mut adu = Vec::with_capacity(pdu.len() + 3);
        adu.push(unit_id);
        adu.extend_from_slice(pdu);
        let crc = crc16(&adu);
        adu.extend(crc.to_le_bytes());

        serial.write_all(&adu).await?;

        let silence = self.inter_frame_timeout();
        let mut frame = Vec::with_capacity(256);
        let mut byte = [0u8; 1];
        loop {
            let per_byte_deadline = match deadline {
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Err(Error::Timeout("modbus-rtu read deadline exceeded".into()));
                    }
                    silence.min(d - now)
                }
                None => silence,
            };

            match tokio::time::timeout(per_byte_deadline, serial.read_exact(&mut byte)).await {
                Ok(result) => {
                    result?;
                    frame.push(byte[0]);
                }
                Err(_) => break, // silence observed: frame is complete
            }
        }

        if frame.len() < 4 {
            return Err(Error::BadResponse("MODBUS RTU frame shorter than unit-id+fc+crc".into()));
        }
        let (body, crc_bytes) = frame.split_at(frame.len() - 2);
        let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
        if crc16(body) != received_crc {
            return Err(Error::BadResponse("MODBUS RTU CRC mismatch".into()));
        }
        if body[0] != unit_id {
            return Err(Error::BadResponse(format!(
                "MODBUS RTU unit-id mismatch: expected {unit_id}, got {}",
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
    fn crc16_matches_known_test_vector() {
        assert_eq!(crc16(&[0x01, 0x04, 0x02, 0xFF, 0xFF]), 0x80B8);
    }
}
