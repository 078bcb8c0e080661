//! Backend adapters: the thing on the other side of a VXI-11 link.
//!
//! An adapter owns exactly one physical or logical resource (a TCP socket to
//! an instrument, a serial port, a USBTMC device, an internal loopback
//! buffer) and exposes it through the same four-operation contract
//! regardless of transport, so `server::Gateway` never needs to know which
//! kind of device it is talking to.

pub mod generic_regex;
pub mod loopback;
pub mod modbus;
pub mod scpi_serial;
pub mod scpi_tcp;
pub mod usbtmc;

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::arbiter::SerialArbiter;
use crate::config::{DeviceConfig, TransportKind};
use crate::error::{Error, Result};

/// Mirrors `rpc::vxi11::ReadReason` but belongs to the adapter layer: the
/// adapter decides why a read stopped, the RPC layer only serializes the
/// verdict onto the wire.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReadOutcome {
    pub request_size_satisfied: bool,
    pub termchr_matched: bool,
    pub end: bool,
}

/// A backend device. Every method is fallible and every adapter is
/// responsible for mapping its own failure modes onto [`Error`] rather than
/// panicking; `server::Gateway` maps the result onto a VXI-11 error code.
///
/// Calling [`Adapter::write`] or [`Adapter::read`] before a successful
/// [`Adapter::acquire`] is a programmer error in the caller and adapters are
/// free to return [`Error::NotAcquired`] rather than guard against it
/// internally, since `server::Gateway` only ever calls them in that order.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Establish the underlying transport (open the socket/port/handle).
    /// Idempotent: calling it again on an already-open adapter is a no-op.
    async fn connect(&mut self) -> Result<()>;

    /// Tear down the underlying transport. Idempotent.
    async fn disconnect(&mut self) -> Result<()>;

    /// Claim exclusive use of the transport for the duration of one VXI-11
    /// operation (or lock period). Serial and USB adapters use this to wait
    /// on the bus arbiter; network adapters typically have nothing to do
    /// here beyond checking they're connected.
    async fn acquire(&mut self, deadline: Option<Instant>) -> Result<()>;

    /// Release whatever `acquire` claimed. Must be safe to call even if
    /// `acquire` was never called or already failed.
    async fn release(&mut self) -> Result<()>;

    /// Write a command/payload to the device, applying mapping rules where
    /// the transport requires them (MODBUS, generic-regex). Returns the
    /// number of bytes of `data` consumed.
    async fn write(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `max_len` bytes, stopping early at a matched termination
    /// character where the transport has one. `deadline` is the I/O
    /// timeout computed by the caller from the request's `io_timeout`.
    async fn read(&mut self, max_len: usize, deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)>;
}

/// Construct the adapter for one configured device. Each backend reads only
/// the config fields relevant to its own transport kind; `config::Config`
/// validation has already ruled out mismatched fields and mapping rules
/// before this is ever called. `rules` is the device's slice of the
/// top-level `mappings` map, already compiled; empty for transports that
/// don't consume mapping rules. `arbiter` is handed to every serial-backed
/// transport so it can serialize its I/O against other devices on the same
/// bus; transports that don't sit on a shared serial line ignore it.
pub fn build(
    device: &DeviceConfig,
    rules: Vec<crate::mapping::CompiledRule>,
    arbiter: Arc<SerialArbiter>,
) -> Result<Box<dyn Adapter>> {
    match device {
        DeviceConfig::Loopback { .. } => Ok(Box::new(loopback::LoopbackAdapter::new())),
        DeviceConfig::ScpiTcp { host, port, .. } => Ok(Box::new(scpi_tcp::ScpiTcpAdapter::new(
            host.clone(),
            *port,
            device.write_termination(),
            device.read_termination(),
        ))),
        DeviceConfig::ScpiSerial {
            port,
            baudrate,
            parity,
            stopbits,
            ..
        } => Ok(Box::new(scpi_serial::ScpiSerialAdapter::new(
            port.clone(),
            *baudrate,
            *parity,
            *stopbits,
            device.write_termination(),
            device.read_termination(),
            arbiter,
        ))),
        DeviceConfig::Usbtmc {
            vendor_id,
            product_id,
            serial_number,
            ..
        } => Ok(Box::new(usbtmc::UsbtmcAdapter::new(
            *vendor_id,
            *product_id,
            serial_number.clone(),
        ))),
        DeviceConfig::ModbusTcp { .. } | DeviceConfig::ModbusRtu { .. } | DeviceConfig::ModbusAscii { .. } => {
            modbus::build_with_rules(device, rules, arbiter)
        }
        DeviceConfig::GenericRegex { .. } => generic_regex::build_with_rules(device, rules, arbiter),
    }
}

pub(crate) fn unsupported(kind: TransportKind) -> Error {
    Error::NotSupported(format!("transport {kind:?} is not implemented"))
}
