//! Generic regex/template adapter, for ad-hoc text protocols that are
//! neither SCPI nor MODBUS: matches the incoming command against a rule's
//! `pattern`, renders `request_format` with the captures, sends it over a
//! TCP or serial channel, and (unless `expects_response` is false) reads
//! back either a static `response` or a templated transform of the wire
//! reply via `response_regex`/`response_format`.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

use crate::adapter::{Adapter, ReadOutcome};
use crate::arbiter::SerialArbiter;
use crate::config::DeviceConfig;
use crate::error::{Error, Result};
use crate::mapping::{self, CompiledRule};

enum Channel {
    Tcp { host: String, port: u16, stream: Option<TcpStream> },
    Serial { path: String, baud: u32, serial: Option<SerialStream> },
}
impl Channel {
    async fn connect(&mut self) -> Result<()> {
        match self {
            Channel::Tcp { host, port, stream } => {
                if stream.is_none() {
                    *stream = Some(TcpStream::connect((host.as_str(), *port)).await?);
                }
            }
            Channel::Serial { path, baud, serial } => {
                if serial.is_none() {
                    *serial = Some(
                        tokio_serial::new(path.as_str(), *baud)
                            .open_native_async()
                            .map_err(|e| Error::Unhandled(e.into()))?,
                    );
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self) {
        match self {
            Channel::Tcp { stream, .. } => {
                stream.take();
            }
            Channel::Serial { serial, .. } => {
                serial.take();
            }
        }
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Channel::Tcp { stream, .. } => {
                stream.as_mut().ok_or(Error::NotAcquired)?.write_all(data).await?;
            }
            Channel::Serial { serial, .. } => {
                serial.as_mut().ok_or(Error::NotAcquired)?.write_all(data).await?;
            }
        }
        Ok(())
    }

    /// Read until `terminator` is seen (when set) or `payload_width` bytes
    /// have arrived (when set); otherwise read whatever is available in one
    /// pass.
    async fn read_reply(&mut self, terminator: Option<&str>, payload_width: Option<usize>) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            let n = match self {
                Channel::Tcp { stream, .. } => stream.as_mut().ok_or(Error::NotAcquired)?.read(&mut byte).await?,
                Channel::Serial { serial, .. } => serial.as_mut().ok_or(Error::NotAcquired)?.read(&mut byte).await?,
            };
            if n == 0 {
                break;
            }
            data.push(byte[0]);

            if let Some(term) = terminator
                && data.ends_with(term.as_bytes())
            {
                break;
            }
            if let Some(width) = payload_width
                && data.len() >= width
            {
                break;
            }
        }
        Ok(data)
    }
}

pub struct GenericRegexAdapter {
    rules: Vec<CompiledRule>,
    channel: Channel,
    output: VecDeque<u8>,
    /// Set only for a serial `Channel`; holds the arbiter and the bus path
    /// to acquire around each `write`'s request/response exchange.
    serial_bus: Option<(Arc<SerialArbiter>, String)>,
}

#[async_trait]
impl Adapter for GenericRegexAdapter {
    async fn connect(&mut self) -> Result<()> {
        self.channel.connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.channel.disconnect();
        Ok(())
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let _guard = match &self.serial_bus {
            Some((arbiter, path)) => Some(arbiter.acquire(path).await?),
            None => None,
        };

        let command = String::from_utf8_lossy(data);
        let command = command.trim_end_matches(['\r', '\n']);
        let (rule, captures) = mapping::find_match(&self.rules, command)?;
        let config = rule.config.clone();

        let request_format = config
            .request_format
            .as_deref()
            .ok_or_else(|| Error::Config("generic-regex rule is missing request_format".into()))?;
        let request = mapping::format_template(request_format, &captures);

        let mut wire = request.into_bytes();
        if let Some(term) = &config.terminator {
            wire.extend(term.as_bytes());
        }
        self.channel.write_all(&wire).await?;

        if !config.expects_response.unwrap_or(true) {
            return Ok(data.len());
        }

        let reply_text = if let Some(response) = &config.response {
            response.clone()
        } else {
            let raw = self
                .channel
                .read_reply(config.terminator.as_deref(), config.payload_width)
                .await?;
            let raw_text = String::from_utf8_lossy(&raw);
            let response_regex = config
                .response_regex
                .as_deref()
                .ok_or_else(|| Error::Config("generic-regex rule has no response or response_regex".into()))?;
            let response_format = config
                .response_format
                .as_deref()
                .ok_or_else(|| Error::Config("generic-regex rule is missing response_format".into()))?;
            let re = regex::Regex::new(response_regex)
                .map_err(|e| Error::Config(format!("invalid response_regex: {e}")))?;
            let caps = re
                .captures(raw_text.trim())
                .ok_or_else(|| Error::BadResponse(format!("response `{raw_text}` did not match response_regex")))?;
            let groups: Vec<String> = caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            let mut text = mapping::format_template(response_format, &groups);

            if let Some(scale) = config.response_scale
                && let Ok(value) = text.parse::<f64>()
            {
                text = (value * scale).to_string();
            }
            text
        };

        self.output.extend(reply_text.into_bytes());
        self.output.push_back(b'\n');
        Ok(data.len())
    }

    async fn read(&mut self, max_len: usize, _deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)> {
        let n = max_len.min(self.output.len());
        let data: Vec<u8> = self.output.drain(..n).collect();
        let outcome = ReadOutcome {
            request_size_satisfied: data.len() == max_len,
            termchr_matched: data.last() == Some(&b'\n'),
            end: self.output.is_empty(),
        };
        Ok((data, outcome))
    }
}

pub fn build_with_rules(device: &DeviceConfig, rules: Vec<CompiledRule>, arbiter: Arc<SerialArbiter>) -> Result<Box<dyn Adapter>> {
    let DeviceConfig::GenericRegex {
        host,
        port,
        serial_port,
        baudrate,
        ..
    } = device
    else {
        return Err(Error::Config("generic-regex adapter given a non-generic-regex device".into()));
    };

    let mut serial_bus = None;
    let channel = match (host, port, serial_port, baudrate) {
        (Some(host), Some(port), _, _) => Channel::Tcp {
            host: host.clone(),
            port: *port,
            stream: None,
        },
        (_, _, Some(serial_port), Some(baud)) => {
            serial_bus = Some((arbiter, serial_port.clone()));
            Channel::Serial {
                path: serial_port.clone(),
                baud: *baud,
                serial: None,
            }
        }
        _ => {
            return Err(Error::Config(
                "generic-regex device needs either host+port or serial_port+baudrate".into(),
            ));
        }
    };

    Ok(Box::new(GenericRegexAdapter {
        rules,
        channel,
        output: VecDeque::new(),
        serial_bus,
    }))
}
