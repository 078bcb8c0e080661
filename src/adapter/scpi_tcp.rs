//! SCPI-over-TCP adapter: a raw byte stream to an instrument's SCPI socket
//! server (typically port 5025), with no MODBUS or regex mapping involved.
//! DEVICE_WRITE bytes go straight to the socket; DEVICE_READ reads straight
//! back, stopping at the device's configured read termination character.

use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};

use crate::adapter::{Adapter, ReadOutcome};
use crate::error::{Error, Result};

pub struct ScpiTcpAdapter {
    host: String,
    port: u16,
    write_termination: String,
    read_termination: String,
    stream: Option<TcpStream>,
}
impl ScpiTcpAdapter {
    pub fn new(host: String, port: u16, write_termination: String, read_termination: String) -> Self {
        Self {
            host,
            port,
            write_termination,
            read_termination,
            stream: None,
        }
    }
}

#[async_trait]
impl Adapter for ScpiTcpAdapter {
    async fn connect(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let addr = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| Error::NotFound(format!("could not resolve {}:{}", self.host, self.port)))?;

        /* TODO: support IPv6 by selecting the socket family from `addr` */
        let socket = TcpSocket::new_v4()?;
        self.stream = Some(socket.connect(addr).await?);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.stream.take();
        Ok(())
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        if self.stream.is_none() {
            return Err(Error::NotAcquired);
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let Some(stream) = &mut self.stream else {
            return Err(Error::NotAcquired);
        };
        stream.write_all(data).await?;
        stream.write_all(self.write_termination.as_bytes()).await?;
        Ok(data.len())
    }

    async fn read(&mut self, max_len: usize, deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)> {
        let Some(stream) = &mut self.stream else {
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
                        return Err(Error::Timeout("scpi-tcp read deadline exceeded".into()));
                    }
                    tokio::time::timeout(deadline - now, stream.read(&mut byte))
                        .await
                        .map_err(|_| Error::Timeout("scpi-tcp read timed out".into()))??
                }
                None => stream.read(&mut byte).await?,
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
