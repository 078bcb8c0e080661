//! MODBUS TCP framing: MBAP header (transaction-id, protocol-id=0, length,
//! unit-id) wrapped around the PDU. One transaction outstanding at a time
//! per adapter, matched by transaction-id.

use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::adapter::modbus::ModbusTransport;
use crate::error::{Error, Result};

pub struct ModbusTcpTransport {
    host: String,
    port: u16,
    stream: Option<TcpStream>,
    next_transaction_id: u16,
}
impl ModbusTcpTransport {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            stream: None,
            next_transaction_id: 1,
        }
    }
}

#[async_trait]
impl ModbusTransport for ModbusTcpTransport {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }
        self.stream = Some(TcpStream::connect((self.host.as_str(), self.port)).await?);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream.take();
        Ok(())
    }

    async fn exchange(&mut self, unit_id: u8, pdu: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotAcquired);
        };

        let transaction_id = self.next_transaction_id;
        self.next_transaction_id = self.next_transaction_id.wrapping_add(1);

        let mut adu = Vec::with_capacity(7 + pdu.len());
        adu.extend(transaction_id.to_be_bytes());
        adu.extend(0u16.to_be_bytes()); // protocol-id
        adu.extend(((pdu.len() + 1) as u16).to_be_bytes());
        adu.push(unit_id);
        adu.extend_from_slice(pdu);

        let write = stream.write_all(&adu);
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout("modbus-tcp write deadline exceeded".into()));
                }
                tokio::time::timeout(deadline - now, write)
                    .await
                    .map_err(|_| Error::Timeout("modbus-tcp write timed out".into()))??;
            }
            None => write.await?,
        }

        let mut header = [0u8; 7];
        let read_header = stream.read_exact(&mut header);
        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout("modbus-tcp read deadline exceeded".into()));
                }
                tokio::time::timeout(deadline - now, read_header)
                    .await
                    .map_err(|_| Error::Timeout("modbus-tcp read timed out".into()))??;
            }
            None => {
                read_header.await?;
            }
        }

        let resp_transaction_id = u16::from_be_bytes([header[0], header[1]]);
        let length = u16::from_be_bytes([header[4], header[5]]) as usize;
        if resp_transaction_id != transaction_id {
            return Err(Error::IoError(std::io::Error::other(format!(
                "MBAP transaction-id mismatch: sent {transaction_id}, got {resp_transaction_id}"
            ))));
        }
        if length == 0 {
            return Err(Error::IoError(std::io::Error::other("MBAP length field is zero")));
        }

        let mut rest = vec![0u8; length - 1];
        stream.read_exact(&mut rest).await?;
        Ok(rest)
    }
}
