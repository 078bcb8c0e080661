//! SCPI-over-serial adapter: a raw byte stream over a serial port, the same
//! semantics as [`super::scpi_tcp::ScpiTcpAdapter`] but sharing the physical
//! bus with other logical devices through the resource manager's serial
//! arbiter (see `crate::arbiter`), which this module acquires for the
//! duration of each write or read.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::adapter::{Adapter, ReadOutcome};
use crate::arbiter::SerialArbiter;
use crate::config::{SerialParity, SerialStopBits};
use crate::error::{Error, Result};

pub struct ScpiSerialAdapter {
    port: String,
    baud: u32,
    parity: SerialParity,
    stopbits: SerialStopBits,
    write_termination: String,
    read_termination: String,
    serial: Option<SerialStream>,
    arbiter: Arc<SerialArbiter>,
}
impl ScpiSerialAdapter {
    pub fn new(
        port: String,
        baud: u32,
        parity: SerialParity,
        stopbits: SerialStopBits,
        write_termination: String,
        read_termination: String,
        arbiter: Arc<SerialArbiter>,
    ) -> Self {
        Self {
            port,
            baud,
            parity,
            stopbits,
            write_termination,
            read_termination,
            serial: None,
            arbiter,
        }
    }
}

#[async_trait]
impl Adapter for ScpiSerialAdapter {
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

        let serial = tokio_serial::new(&self.port, self.baud)
            .parity(parity)
            .stop_bits(stop_bits)
            .open_native_async()
            .map_err(|e| Error::Unhandled(e.into()))?;
        self.serial = Some(serial);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.serial.take();
        Ok(())
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        if self.serial.is_none() {
            return Err(Error::NotAcquired);
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let _guard = self.arbiter.acquire(&self.port).await?;
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotAcquired);
        };
        debug!(
            "scpi-serial write: {}",
            String::from_utf8_lossy(data).replace('\n', "\\n").replace('\r', "\\r")
        );
        serial.write_all(data).await?;
        serial.write_all(self.write_termination.as_bytes()).await?;
        Ok(data.len())
    }

    async fn read(&mut self, max_len: usize, deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)> {
        let _guard = self.arbiter.acquire(&self.port).await?;
        let Some(serial) = &mut self.serial else {
            return Err(Error::NotAcquired);
        };

        let mut data = Vec::with_capacity(max_len.min(4096));
        let mut byte = [0u8; 1];
        loop {
            if data.len() >= max_len {
                break;
            }
            let read = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout("scpi-serial read deadline exceeded".into()));
                    }
                    tokio::time::timeout(deadline - now, serial.read(&mut byte))
                        .await
                        .map_err(|_| Error::Timeout("scpi-serial read timed out".into()))??
                }
                None => serial.read(&mut byte).await?,
            };
            if read == 0 {
                break;
            }
            data.push(byte[0]);
            if data.ends_with(self.read_termination.as_bytes()) {
                return Ok((
                    data,
                    ReadOutcome {
                        request_size_satisfied: false,
                        termchr_matched: true,
                        end: true,
                    },
                ));
            }
        }

        let satisfied = data.len() == max_len;
        Ok((
            data,
            ReadOutcome {
                request_size_satisfied: satisfied,
                termchr_matched: false,
                end: satisfied,
            },
        ))
    }
}
