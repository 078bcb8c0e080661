//! MODBUS command-mapping adapter, shared across the TCP/RTU/ASCII framings
//! in [`tcp`], [`rtu`], and [`ascii`]. Each framing module only knows how to
//! exchange one application-layer PDU for another; this module owns the
//! rule matching, PDU construction, and response decoding that's common to
//! all three.

pub mod ascii;
pub mod rtu;
pub mod tcp;

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::adapter::{Adapter, ReadOutcome};
use crate::arbiter::SerialArbiter;
use crate::config::{DeviceConfig, ModbusAction, TransportKind};
use crate::error::{Error, Result};
use crate::mapping::{self, CompiledRule};

pub const FC_READ_COILS: u8 = 0x01;
pub const FC_READ_DISCRETE_INPUTS: u8 = 0x02;
pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_READ_INPUT_REGISTERS: u8 = 0x04;
pub const FC_WRITE_SINGLE_COIL: u8 = 0x05;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;
pub const FC_WRITE_MULTIPLE_COILS: u8 = 0x0F;
pub const FC_WRITE_MULTIPLE_REGISTERS: u8 = 0x10;
const EXCEPTION_BIT: u8 = 0x80;

/// MODBUS application-layer exceptions (function code's high bit set).
/// `Undefined` preserves codes the specification does not define so
/// diagnostics don't lose information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    IllegalFunction,
    IllegalDataAddress,
    IllegalDataValue,
    DeviceFailure,
    Acknowledge,
    DeviceBusy,
    MemoryParityError,
    GatewayPathUnavailable,
    GatewayTargetDeviceFailedToRespond,
    Undefined(u8),
}
impl Exception {
    pub const fn as_code(self) -> u8 {
        match self {
            Self::IllegalFunction => 0x01,
            Self::IllegalDataAddress => 0x02,
            Self::IllegalDataValue => 0x03,
            Self::DeviceFailure => 0x04,
            Self::Acknowledge => 0x05,
            Self::DeviceBusy => 0x06,
            Self::MemoryParityError => 0x08,
            Self::GatewayPathUnavailable => 0x0A,
            Self::GatewayTargetDeviceFailedToRespond => 0x0B,
            Self::Undefined(code) => code,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            0x01 => Self::IllegalFunction,
            0x02 => Self::IllegalDataAddress,
            0x03 => Self::IllegalDataValue,
            0x04 => Self::DeviceFailure,
            0x05 => Self::Acknowledge,
            0x06 => Self::DeviceBusy,
            0x08 => Self::MemoryParityError,
            0x0A => Self::GatewayPathUnavailable,
            0x0B => Self::GatewayTargetDeviceFailedToRespond,
            code => Self::Undefined(code),
        }
    }
}

fn function_code(action: ModbusAction) -> u8 {
    match action {
        ModbusAction::ReadCoils => FC_READ_COILS,
        ModbusAction::ReadDiscreteInputs => FC_READ_DISCRETE_INPUTS,
        ModbusAction::ReadHoldingRegisters => FC_READ_HOLDING_REGISTERS,
        ModbusAction::ReadInputRegisters => FC_READ_INPUT_REGISTERS,
        ModbusAction::WriteSingleCoil => FC_WRITE_SINGLE_COIL,
        ModbusAction::WriteSingleRegister => FC_WRITE_SINGLE_REGISTER,
        ModbusAction::WriteMultipleCoils => FC_WRITE_MULTIPLE_COILS,
        ModbusAction::WriteHoldingRegisters => FC_WRITE_MULTIPLE_REGISTERS,
    }
}

/// Build the request PDU for one matched rule, resolving `value` against
/// the command's regex captures where needed.
fn build_request_pdu(rule: &CompiledRule, captures: &[String]) -> Result<Vec<u8>> {
    let action = rule
        .config
        .action
        .ok_or_else(|| Error::Config("MODBUS rule is missing `action`".into()))?;
    let params = rule
        .config
        .params
        .as_ref()
        .ok_or_else(|| Error::Config("MODBUS rule is missing `params`".into()))?;

    let fc = function_code(action);
    let mut pdu = vec![fc];
    pdu.extend(params.address.to_be_bytes());

    match action {
        ModbusAction::ReadCoils
        | ModbusAction::ReadDiscreteInputs
        | ModbusAction::ReadHoldingRegisters
        | ModbusAction::ReadInputRegisters => {
            let count = params.count.unwrap_or(1);
            pdu.extend(count.to_be_bytes());
        }
        ModbusAction::WriteSingleCoil => {
            let value = params
                .value
                .as_ref()
                .ok_or_else(|| Error::Config("write_single_coil rule needs `value`".into()))?;
            let text = mapping::resolve_value(value, captures)?;
            let on = matches!(text.trim(), "1" | "true" | "on" | "ON" | "true");
            pdu.extend(if on { [0xFFu8, 0x00] } else { [0x00, 0x00] });
        }
        ModbusAction::WriteSingleRegister => {
            let value = params
                .value
                .as_ref()
                .ok_or_else(|| Error::Config("write_single_register rule needs `value`".into()))?;
            let text = mapping::resolve_value(value, captures)?;
            let data_type = params.data_type.unwrap_or(crate::config::DataType::Uint16);
            let regs = mapping::encode_registers(data_type, &text, params.count)?;
            let reg = *regs.first().ok_or_else(|| Error::Config("empty register encoding".into()))?;
            pdu.extend(reg.to_be_bytes());
        }
        ModbusAction::WriteMultipleCoils => {
            let value = params
                .value
                .as_ref()
                .ok_or_else(|| Error::Config("write_multiple_coils rule needs `value`".into()))?;
            let text = mapping::resolve_value(value, captures)?;
            let bits: Vec<bool> = text
                .chars()
                .filter(|c| *c == '0' || *c == '1')
                .map(|c| c == '1')
                .collect();
            pdu.extend((bits.len() as u16).to_be_bytes());
            let byte_count = bits.len().div_ceil(8);
            pdu.push(byte_count as u8);
            let mut bytes = vec![0u8; byte_count];
            for (i, bit) in bits.iter().enumerate() {
                if *bit {
                    bytes[i / 8] |= 1 << (i % 8);
                }
            }
            pdu.extend(bytes);
        }
        ModbusAction::WriteHoldingRegisters => {
            let value = params
                .value
                .as_ref()
                .ok_or_else(|| Error::Config("write_holding_registers rule needs `value`".into()))?;
            let text = mapping::resolve_value(value, captures)?;
            let data_type = params.data_type.unwrap_or(crate::config::DataType::Uint16);
            let regs = mapping::encode_registers(data_type, &text, params.count)?;
            pdu.extend((regs.len() as u16).to_be_bytes());
            pdu.push((regs.len() * 2) as u8);
            for reg in regs {
                pdu.extend(reg.to_be_bytes());
            }
        }
    }

    Ok(pdu)
}

/// Decode a response PDU into the ASCII text to hand back to the VXI-11
/// client, returning `None` when the action has nothing to report (a bare
/// write acknowledgement).
fn decode_response_pdu(rule: &CompiledRule, response: &[u8]) -> Result<Option<String>> {
    if response.is_empty() {
        return Err(Error::BadResponse("empty MODBUS response PDU".into()));
    }
    let fc = response[0];
    if fc & EXCEPTION_BIT != 0 {
        let code = *response.get(1).unwrap_or(&0);
        return Err(Error::ModbusException {
            function: fc & !EXCEPTION_BIT,
            code,
        });
    }

    let action = rule
        .config
        .action
        .ok_or_else(|| Error::Config("MODBUS rule is missing `action`".into()))?;
    let params = rule.config.params.as_ref();

    match action {
        ModbusAction::ReadHoldingRegisters | ModbusAction::ReadInputRegisters => {
            let byte_count = *response.get(1).ok_or_else(|| Error::BadResponse("truncated PDU".into()))? as usize;
            let data = response
                .get(2..2 + byte_count)
                .ok_or_else(|| Error::BadResponse("truncated PDU payload".into()))?;
            let regs: Vec<u16> = data.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect();
            let data_type = params.and_then(|p| p.data_type).unwrap_or(crate::config::DataType::Uint16);
            Ok(Some(mapping::decode_registers(data_type, &regs)?))
        }
        ModbusAction::ReadCoils | ModbusAction::ReadDiscreteInputs => {
            let byte_count = *response.get(1).ok_or_else(|| Error::BadResponse("truncated PDU".into()))? as usize;
            let data = response
                .get(2..2 + byte_count)
                .ok_or_else(|| Error::BadResponse("truncated PDU payload".into()))?;
            let count = params.and_then(|p| p.count).unwrap_or(1) as usize;
            let bits: String = (0..count)
                .map(|i| if data[i / 8] & (1 << (i % 8)) != 0 { '1' } else { '0' })
                .collect();
            Ok(Some(bits))
        }
        ModbusAction::WriteSingleCoil
        | ModbusAction::WriteSingleRegister
        | ModbusAction::WriteMultipleCoils
        | ModbusAction::WriteHoldingRegisters => Ok(None),
    }
}

/// Exchanges whole PDUs with a framed transport. Implemented once per
/// MODBUS framing (TCP's MBAP, RTU's CRC-16, ASCII's LRC+hex).
#[async_trait]
pub trait ModbusTransport: Send + Sync {
    async fn connect(&mut self) -> Result<()>;
    async fn disconnect(&mut self) -> Result<()>;
    async fn exchange(&mut self, unit_id: u8, pdu: &[u8], deadline: Option<Instant>) -> Result<Vec<u8>>;
}

pub struct ModbusAdapter<T: ModbusTransport> {
    unit_id: u8,
    rules: Vec<CompiledRule>,
    transport: T,
    output: VecDeque<u8>,
}
impl<T: ModbusTransport> ModbusAdapter<T> {
    pub fn new(unit_id: u8, rules: Vec<CompiledRule>, transport: T) -> Self {
        Self {
            unit_id,
            rules,
            transport,
            output: VecDeque::new(),
        }
    }
}

#[async_trait]
impl<T: ModbusTransport> Adapter for ModbusAdapter<T> {
    async fn connect(&mut self) -> Result<()> {
        self.transport.connect().await
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let command = String::from_utf8_lossy(data);
        let command = command.trim_end_matches(['\r', '\n']);
        let (rule, captures) = mapping::find_match(&self.rules, command)?;
        let pdu = build_request_pdu(rule, &captures)?;
        let response = self.transport.exchange(self.unit_id, &pdu, None).await?;
        if let Some(text) = decode_response_pdu(rule, &response)? {
            self.output.extend(text.into_bytes());
            self.output.push_back(b'\n');
        }
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

/// Build the right framed MODBUS adapter for a device, compiling its
/// mapping rules up front. `rules` is the device's section of the
/// top-level `mappings` map (empty if it declared none).
pub fn build_with_rules(device: &DeviceConfig, rules: Vec<CompiledRule>, arbiter: Arc<SerialArbiter>) -> Result<Box<dyn Adapter>> {
    let unit_id = device
        .unit_id()
        .ok_or_else(|| Error::Config("MODBUS device is missing unit_id".into()))?;

    match device {
        DeviceConfig::ModbusTcp { host, port, .. } => Ok(Box::new(ModbusAdapter::new(
            unit_id,
            rules,
            tcp::ModbusTcpTransport::new(host.clone(), *port),
        ))),
        DeviceConfig::ModbusRtu {
            port,
            baudrate,
            parity,
            stopbits,
            ..
        } => Ok(Box::new(ModbusAdapter::new(
            unit_id,
            rules,
            rtu::ModbusRtuTransport::new(port.clone(), *baudrate, *parity, *stopbits, arbiter),
        ))),
        DeviceConfig::ModbusAscii {
            port,
            baudrate,
            parity,
            stopbits,
            ..
        } => Ok(Box::new(ModbusAdapter::new(
            unit_id,
            rules,
            ascii::ModbusAsciiTransport::new(port.clone(), *baudrate, *parity, *stopbits, arbiter),
        ))),
        _ => Err(crate::adapter::unsupported(TransportKind::ModbusTcp)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DataType, ModbusParams};

    fn rule(action: ModbusAction, params: ModbusParams) -> CompiledRule {
        CompiledRule {
            regex: regex::Regex::new("^X$").unwrap(),
            config: crate::config::MappingRuleConfig {
                pattern: "^X$".to_string(),
                action: Some(action),
                params: Some(params),
                request_format: None,
                response_regex: None,
                response_format: None,
                response: None,
                payload_width: None,
                expects_response: None,
                scale: None,
                terminator: None,
                response_scale: None,
            },
        }
    }

    #[test]
    fn read_holding_registers_pdu_has_function_code_and_address() {
        let r = rule(
            ModbusAction::ReadHoldingRegisters,
            ModbusParams {
                address: 100,
                count: Some(2),
                data_type: Some(DataType::Float32Be),
                value: None,
            },
        );
        let pdu = build_request_pdu(&r, &[]).unwrap();
        assert_eq!(pdu, vec![FC_READ_HOLDING_REGISTERS, 0x00, 0x64, 0x00, 0x02]);
    }

    #[test]
    fn write_single_register_encodes_literal_value() {
        let r = rule(
            ModbusAction::WriteSingleRegister,
            ModbusParams {
                address: 10,
                count: None,
                data_type: Some(DataType::Uint16),
                value: Some(serde_yaml::Value::Number(7.into())),
            },
        );
        let pdu = build_request_pdu(&r, &[]).unwrap();
        assert_eq!(pdu, vec![FC_WRITE_SINGLE_REGISTER, 0x00, 0x0A, 0x00, 0x07]);
    }

    #[test]
    fn exception_response_maps_to_modbus_exception_error() {
        let r = rule(
            ModbusAction::ReadHoldingRegisters,
            ModbusParams {
                address: 0,
                count: Some(1),
                data_type: None,
                value: None,
            },
        );
        let err = decode_response_pdu(&r, &[FC_READ_HOLDING_REGISTERS | EXCEPTION_BIT, 0x02]).unwrap_err();
        assert!(matches!(
            err,
            Error::ModbusException {
                function: FC_READ_HOLDING_REGISTERS,
                code: 0x02
            }
        ));
    }

    #[test]
    fn read_holding_registers_response_decodes_float() {
        let r = rule(
            ModbusAction::ReadHoldingRegisters,
            ModbusParams {
                address: 100,
                count: Some(2),
                data_type: Some(DataType::Float32Be),
                value: None,
            },
        );
        let regs = mapping::encode_registers(DataType::Float32Be, "23.5", None).unwrap();
        let mut response = vec![FC_READ_HOLDING_REGISTERS, 4];
        for reg in regs {
            response.extend(reg.to_be_bytes());
        }
        let text = decode_response_pdu(&r, &response).unwrap().unwrap();
        assert_eq!(text, "23.5");
    }
}
