//! Configuration schema (VXI-11 gateway, §6 of the design).
//!
//! This module owns the YAML-shaped document that `server`, `devices`, and
//! `mappings` live in. Parsing uses `serde_yaml`; validation and the
//! embedded-vs-top-level mapping canonicalization happen here, not in the
//! adapters that consume the result. The loaded [`Config`] is treated as an
//! immutable snapshot: existing links keep running against the snapshot they
//! were created under even after a reload replaces it (see DESIGN.md).

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub devices: HashMap<String, DeviceConfig>,
    #[serde(default)]
    pub mappings: HashMap<String, Vec<MappingRuleConfig>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_true")]
    pub portmapper_enabled: bool,
    #[serde(default)]
    pub gui: GuiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GuiConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_gui_port")]
    pub port: u16,
}
impl Default for GuiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: default_host(),
            port: default_gui_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    1024
}
fn default_gui_port() -> u16 {
    8080
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    None,
    Odd,
    Even,
}
impl Default for SerialParity {
    fn default() -> Self {
        Self::None
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum SerialStopBits {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "2")]
    Two,
}
impl Default for SerialStopBits {
    fn default() -> Self {
        Self::One
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    ScpiTcp,
    ScpiSerial,
    ModbusTcp,
    ModbusRtu,
    ModbusAscii,
    Usbtmc,
    Loopback,
    GenericRegex,
}
impl TransportKind {
    /// Whether this transport kind requires exclusive hardware access
    /// absent an explicit `requires_lock` override (spec.md §3).
    pub fn default_requires_lock(self) -> bool {
        matches!(
            self,
            Self::Usbtmc | Self::ScpiSerial | Self::ModbusRtu | Self::ModbusAscii
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum DeviceConfig {
    ScpiTcp {
        host: String,
        port: u16,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
        write_termination: Option<String>,
        read_termination: Option<String>,
    },
    ScpiSerial {
        port: String,
        baudrate: u32,
        #[serde(default)]
        parity: SerialParity,
        #[serde(default)]
        stopbits: SerialStopBits,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
        write_termination: Option<String>,
        read_termination: Option<String>,
    },
    ModbusTcp {
        host: String,
        port: u16,
        unit_id: u8,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
    },
    ModbusRtu {
        port: String,
        baudrate: u32,
        unit_id: u8,
        #[serde(default)]
        parity: SerialParity,
        #[serde(default)]
        stopbits: SerialStopBits,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
    },
    ModbusAscii {
        port: String,
        baudrate: u32,
        unit_id: u8,
        #[serde(default)]
        parity: SerialParity,
        #[serde(default)]
        stopbits: SerialStopBits,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
    },
    Usbtmc {
        vendor_id: u16,
        product_id: u16,
        serial_number: Option<String>,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
    },
    Loopback {
        requires_lock: Option<bool>,
    },
    GenericRegex {
        host: Option<String>,
        port: Option<u16>,
        serial_port: Option<String>,
        baudrate: Option<u32>,
        #[serde(default)]
        parity: SerialParity,
        #[serde(default)]
        stopbits: SerialStopBits,
        requires_lock: Option<bool>,
        io_timeout: Option<f64>,
        write_termination: Option<String>,
        read_termination: Option<String>,
    },
}
impl DeviceConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::ScpiTcp { .. } => TransportKind::ScpiTcp,
            Self::ScpiSerial { .. } => TransportKind::ScpiSerial,
            Self::ModbusTcp { .. } => TransportKind::ModbusTcp,
            Self::ModbusRtu { .. } => TransportKind::ModbusRtu,
            Self::ModbusAscii { .. } => TransportKind::ModbusAscii,
            Self::Usbtmc { .. } => TransportKind::Usbtmc,
            Self::Loopback { .. } => TransportKind::Loopback,
            Self::GenericRegex { .. } => TransportKind::GenericRegex,
        }
    }

    pub fn is_modbus(&self) -> bool {
        matches!(
            self.kind(),
            TransportKind::ModbusTcp | TransportKind::ModbusRtu | TransportKind::ModbusAscii
        )
    }

    fn requires_lock_override(&self) -> Option<bool> {
        match self {
            Self::ScpiTcp { requires_lock, .. }
            | Self::ScpiSerial { requires_lock, .. }
            | Self::ModbusTcp { requires_lock, .. }
            | Self::ModbusRtu { requires_lock, .. }
            | Self::ModbusAscii { requires_lock, .. }
            | Self::Usbtmc { requires_lock, .. }
            | Self::Loopback { requires_lock }
            | Self::GenericRegex { requires_lock, .. } => *requires_lock,
        }
    }

    pub fn requires_lock(&self) -> bool {
        self.requires_lock_override()
            .unwrap_or_else(|| self.kind().default_requires_lock())
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        let secs = match self {
            Self::ScpiTcp { io_timeout, .. }
            | Self::ScpiSerial { io_timeout, .. }
            | Self::ModbusTcp { io_timeout, .. }
            | Self::ModbusRtu { io_timeout, .. }
            | Self::ModbusAscii { io_timeout, .. }
            | Self::Usbtmc { io_timeout, .. }
            | Self::GenericRegex { io_timeout, .. } => *io_timeout,
            Self::Loopback { .. } => None,
        };
        secs.map(Duration::from_secs_f64)
    }

    pub fn write_termination(&self) -> String {
        match self {
            Self::ScpiTcp {
                write_termination, ..
            }
            | Self::ScpiSerial {
                write_termination, ..
            }
            | Self::GenericRegex {
                write_termination, ..
            } => write_termination.clone().unwrap_or_else(|| "\n".to_string()),
            _ => "\n".to_string(),
        }
    }

    pub fn read_termination(&self) -> String {
        match self {
            Self::ScpiTcp {
                read_termination, ..
            }
            | Self::ScpiSerial {
                read_termination, ..
            }
            | Self::GenericRegex {
                read_termination, ..
            } => read_termination.clone().unwrap_or_else(|| "\n".to_string()),
            _ => "\n".to_string(),
        }
    }

    pub fn unit_id(&self) -> Option<u8> {
        match self {
            Self::ModbusTcp { unit_id, .. }
            | Self::ModbusRtu { unit_id, .. }
            | Self::ModbusAscii { unit_id, .. } => Some(*unit_id),
            _ => None,
        }
    }

    /// Identifier for the *physical* resource this device sits on, used as
    /// the resource-manager lock key. Takes the device's logical name
    /// because a serial bus can be multi-dropped: two MODBUS-RTU devices on
    /// the same `port` are two distinct lockable resources (different
    /// unit-ids), sharing only the bus itself, which `serial_path` keys
    /// separately for the arbiter. Per spec.md §3: locks are per logical
    /// device, the arbiter is per bus.
    pub fn physical_id(&self, name: &str) -> String {
        match self {
            Self::ScpiTcp { host, port, .. } => format!("tcp:{host}:{port}"),
            Self::ModbusTcp { host, port, .. } => format!("tcp:{host}:{port}"),
            Self::ScpiSerial { port, .. }
            | Self::ModbusRtu { port, .. }
            | Self::ModbusAscii { port, .. } => format!("serial:{port}:{name}"),
            Self::Usbtmc {
                vendor_id,
                product_id,
                serial_number,
                ..
            } => format!(
                "usb:{vendor_id:04x}:{product_id:04x}:{}",
                serial_number.as_deref().unwrap_or("*")
            ),
            Self::Loopback { .. } => "loopback".to_string(),
            Self::GenericRegex {
                host,
                port,
                serial_port,
                ..
            } => match (host, port, serial_port) {
                (Some(h), Some(p), _) => format!("tcp:{h}:{p}"),
                (_, _, Some(sp)) => format!("serial:{sp}:{name}"),
                _ => "generic-regex:unconfigured".to_string(),
            },
        }
    }

    /// Serial bus path, if this transport sits on one. Distinct from
    /// `physical_id` in purpose: the arbiter keys on the bus, the resource
    /// manager keys on the logical device.
    pub fn serial_path(&self) -> Option<&str> {
        match self {
            Self::ScpiSerial { port, .. }
            | Self::ModbusRtu { port, .. }
            | Self::ModbusAscii { port, .. } => Some(port),
            Self::GenericRegex { serial_port, .. } => serial_port.as_deref(),
            _ => None,
        }
    }
}

/// A single mapping rule, flattened across both the MODBUS and
/// generic-regex action schemas (spec.md §6) since each device's `type`
/// determines which half of the schema is legal; `Config::validate`
/// enforces the split instead of the type system, so unknown-field
/// rejection stays a single `deny_unknown_fields` away.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct MappingRuleConfig {
    pub pattern: String,

    // MODBUS schema
    pub action: Option<ModbusAction>,
    pub params: Option<ModbusParams>,

    // generic-regex schema
    pub request_format: Option<String>,
    pub response_regex: Option<String>,
    pub response_format: Option<String>,
    pub response: Option<String>,
    pub payload_width: Option<usize>,
    pub expects_response: Option<bool>,
    pub scale: Option<f64>,
    pub terminator: Option<String>,
    pub response_scale: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModbusAction {
    ReadHoldingRegisters,
    ReadInputRegisters,
    ReadCoils,
    ReadDiscreteInputs,
    WriteSingleRegister,
    WriteHoldingRegisters,
    WriteSingleCoil,
    WriteMultipleCoils,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Uint16,
    Int16,
    Uint32Be,
    Uint32Le,
    Int32Be,
    Int32Le,
    Float32Be,
    Float32Le,
    String,
}
impl DataType {
    /// Number of 16-bit registers this type occupies (`string` depends on
    /// the rule's `count`, handled separately by the caller).
    pub fn register_width(self) -> u16 {
        match self {
            Self::Uint16 | Self::Int16 => 1,
            Self::Uint32Be | Self::Uint32Le | Self::Int32Be | Self::Int32Le | Self::Float32Be
            | Self::Float32Le => 2,
            Self::String => 0,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModbusParams {
    pub address: u16,
    pub count: Option<u16>,
    pub data_type: Option<DataType>,
    pub value: Option<serde_yaml::Value>,
}

fn canonical_kebab(name: &str) -> String {
    name.to_string()
}

impl Config {
    /// Parse and validate a configuration document, canonicalizing
    /// embedded-vs-top-level mappings per spec.md §9's open question: this
    /// implementation only ever reads the top-level `mappings` section (the
    /// source format this crate accepts has no embedded per-device
    /// `mappings` key at all) and rejects a document that tries to use one,
    /// rather than silently merging.
    pub fn from_yaml_str(source: &str) -> Result<Self> {
        let raw: serde_yaml::Value = serde_yaml::from_str(source)
            .map_err(|e| Error::Config(format!("invalid YAML: {e}")))?;

        if let serde_yaml::Value::Mapping(map) = &raw {
            for (name, value) in map.get("devices").and_then(|d| d.as_mapping()).into_iter().flatten() {
                if value.as_mapping().and_then(|m| m.get("mappings")).is_some() {
                    let name = name.as_str().unwrap_or("<unknown>");
                    return Err(Error::Config(format!(
                        "device `{name}` declares an embedded `mappings` key; move it to the top-level `mappings` section instead of mixing the two forms"
                    )));
                }
            }
        }

        let config: Config =
            serde_yaml::from_value(raw).map_err(|e| Error::Config(format!("invalid configuration: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    fn validate(&self) -> Result<()> {
        for (name, device) in &self.devices {
            if canonical_kebab(name) != *name {
                // placeholder for future name-normalization rules; today any
                // string is a legal logical name.
            }
            if let Some(unit_id) = device.unit_id()
                && !(1..=247).contains(&unit_id)
            {
                return Err(Error::Config(format!(
                    "device `{name}`: unit_id {unit_id} out of range 1..=247"
                )));
            }
        }

        for (device_name, rules) in &self.mappings {
            let device = self.devices.get(device_name).ok_or_else(|| {
                Error::Config(format!(
                    "mappings reference unknown device `{device_name}`"
                ))
            })?;

            for (idx, rule) in rules.iter().enumerate() {
                regex::Regex::new(&rule.pattern).map_err(|e| {
                    Error::Config(format!(
                        "device `{device_name}` rule #{idx}: invalid pattern `{}`: {e}",
                        rule.pattern
                    ))
                })?;

                if device.is_modbus() {
                    validate_modbus_rule(device_name, idx, rule)?;
                } else if matches!(device.kind(), TransportKind::GenericRegex) {
                    validate_generic_regex_rule(device_name, idx, rule)?;
                } else {
                    return Err(Error::Config(format!(
                        "device `{device_name}` is not a MODBUS or generic-regex device and cannot carry mapping rules"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn validate_modbus_rule(device_name: &str, idx: usize, rule: &MappingRuleConfig) -> Result<()> {
    if rule.request_format.is_some()
        || rule.response_regex.is_some()
        || rule.response_format.is_some()
        || rule.response.is_some()
        || rule.payload_width.is_some()
        || rule.expects_response.is_some()
        || rule.scale.is_some()
        || rule.terminator.is_some()
        || rule.response_scale.is_some()
    {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: generic-regex keys are not valid on a MODBUS device"
        )));
    }
    let Some(params) = &rule.params else {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: MODBUS rule is missing `params`"
        )));
    };
    if rule.action.is_none() {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: MODBUS rule is missing `action`"
        )));
    }
    if let Some(serde_yaml::Value::String(s)) = &params.value
        && let Some(idx_str) = s.strip_prefix('$')
        && idx_str.parse::<u32>().is_err()
    {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: `value: {s}` looks like a capture reference but is not a valid `$N`"
        )));
    }
    Ok(())
}

fn validate_generic_regex_rule(device_name: &str, idx: usize, rule: &MappingRuleConfig) -> Result<()> {
    if rule.action.is_some() || rule.params.is_some() {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: MODBUS `action`/`params` are not valid on a generic-regex device"
        )));
    }
    if rule.request_format.is_none() {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: generic-regex rule is missing `request_format`"
        )));
    }
    if rule.response.is_none() && (rule.response_regex.is_none() || rule.response_format.is_none()) {
        return Err(Error::Config(format!(
            "device `{device_name}` rule #{idx}: generic-regex rule needs either `response` or both `response_regex` and `response_format`"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
server:
  port: 1024
devices:
  echo:
    type: loopback
"#;

    #[test]
    fn minimal_config_loads_with_defaults() {
        let config = Config::from_yaml_str(MINIMAL).unwrap();
        assert_eq!(config.server.port, 1024);
        assert!(config.server.portmapper_enabled);
        assert_eq!(config.devices.len(), 1);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let bad = format!("{MINIMAL}\nbogus: true\n");
        assert!(Config::from_yaml_str(&bad).is_err());
    }

    #[test]
    fn embedded_device_mappings_are_rejected_not_merged() {
        let bad = r#"
server:
  port: 1024
devices:
  oven:
    type: modbus-tcp
    host: 10.0.0.5
    port: 502
    unit_id: 5
    mappings:
      - pattern: "FOO"
"#;
        let err = Config::from_yaml_str(bad).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn out_of_range_unit_id_is_rejected() {
        let bad = r#"
server:
  port: 1024
devices:
  oven:
    type: modbus-tcp
    host: 10.0.0.5
    port: 502
    unit_id: 250
"#;
        assert!(Config::from_yaml_str(bad).is_err());
    }

    #[test]
    fn modbus_rule_resolves_and_requires_lock_defaults() {
        let yaml = r#"
server:
  port: 1024
devices:
  oven:
    type: modbus-tcp
    host: 10.0.0.5
    port: 502
    unit_id: 5
mappings:
  oven:
    - pattern: "MEAS:TEMP\\?"
      action: read_holding_registers
      params: { address: 100, count: 2, data_type: float32_be }
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        let device = &config.devices["oven"];
        assert!(!device.requires_lock());
        assert_eq!(device.unit_id(), Some(5));
        assert_eq!(config.mappings["oven"].len(), 1);
    }

    #[test]
    fn usbtmc_defaults_to_requires_lock() {
        let yaml = r#"
server:
  port: 1024
devices:
  scope:
    type: usbtmc
    vendor_id: 0x1313
    product_id: 0x8078
"#;
        let config = Config::from_yaml_str(yaml).unwrap();
        assert!(config.devices["scope"].requires_lock());
    }

    #[test]
    fn mapping_on_non_modbus_non_regex_device_is_rejected() {
        let yaml = r#"
server:
  port: 1024
devices:
  scope:
    type: scpi-tcp
    host: 10.0.0.5
    port: 5025
mappings:
  scope:
    - pattern: "FOO"
      action: read_holding_registers
      params: { address: 1 }
"#;
        assert!(Config::from_yaml_str(yaml).is_err());
    }
}
