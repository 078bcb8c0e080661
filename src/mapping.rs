//! Command mapping engine: matches incoming ASCII commands against a
//! device's ordered mapping rules and performs the type-aware register
//! encode/decode the MODBUS and generic-regex adapters need on either side
//! of the wire.

use regex::Regex;

use crate::config::{DataType, MappingRuleConfig};
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct CompiledRule {
    pub regex: Regex,
    pub config: MappingRuleConfig,
}

/// Compile every rule's pattern once at adapter construction time rather
/// than per-command; `config::Config::validate` already proved each pattern
/// compiles, so a failure here would mean the config changed out from under
/// us.
pub fn compile(rules: &[MappingRuleConfig]) -> Result<Vec<CompiledRule>> {
    rules
        .iter()
        .map(|rule| {
            Regex::new(&rule.pattern)
                .map(|regex| CompiledRule {
                    regex,
                    config: rule.clone(),
                })
                .map_err(|e| Error::Config(format!("invalid pattern `{}`: {e}", rule.pattern)))
        })
        .collect()
}

/// Find the first rule (in declaration order) whose pattern matches the
/// *entire* `command`, returning it along with the regex's captures
/// rendered as strings (index 0 is always the whole match, so `$1` is
/// `captures[1]`). A rule whose pattern only matches somewhere inside
/// `command` (e.g. `MEAS:TEMP?` against `XMEAS:TEMXFOO`) does not count;
/// `Regex::captures` is not implicitly anchored, so the match bounds are
/// checked explicitly instead of anchoring the pattern at compile time,
/// which would double up with patterns that already supply their own `^`/`$`.
pub fn find_match<'a>(rules: &'a [CompiledRule], command: &str) -> Result<(&'a CompiledRule, Vec<String>)> {
    for rule in rules {
        if let Some(caps) = rule.regex.captures(command) {
            let whole = caps.get(0).expect("capture group 0 is always present");
            if whole.start() != 0 || whole.end() != command.len() {
                continue;
            }
            let captures = caps
                .iter()
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect();
            return Ok((rule, captures));
        }
    }
    Err(Error::NoMatchingRule(command.to_string()))
}

/// Resolve a `value` field: `"$N"` refers to capture group N from the match
/// that selected this rule, anything else is used as a literal.
pub fn resolve_value(value: &serde_yaml::Value, captures: &[String]) -> Result<String> {
    if let serde_yaml::Value::String(s) = value
        && let Some(n) = s.strip_prefix('$')
        && let Ok(n) = n.parse::<usize>()
    {
        return captures
            .get(n)
            .cloned()
            .ok_or_else(|| Error::NoMatchingRule(format!("capture group ${n} does not exist")));
    }
    Ok(match value {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => return Err(Error::Config(format!("unsupported mapping value: {other:?}"))),
    })
}

/// Substitute `$N` placeholders in a generic-regex `request_format`/
/// `response_format` template with capture strings.
pub fn format_template(template: &str, captures: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek()
            && d.is_ascii_digit()
        {
            digits.push(*d);
            chars.next();
        }
        if digits.is_empty() {
            out.push('$');
            continue;
        }
        let n: usize = digits.parse().unwrap();
        out.push_str(captures.get(n).map(String::as_str).unwrap_or(""));
    }
    out
}

/// Number of 16-bit registers a `value` of this type will occupy, given a
/// rule's `count` (only meaningful for `string`).
pub fn register_count(data_type: DataType, count: Option<u16>) -> u16 {
    match data_type {
        DataType::String => count.unwrap_or(1),
        other => other.register_width(),
    }
}

/// Encode a literal value string into the registers a WRITE_* PDU should
/// carry, per the byte-order rules of `data_type`.
pub fn encode_registers(data_type: DataType, value: &str, count: Option<u16>) -> Result<Vec<u16>> {
    let parse_err = |e: std::num::ParseIntError| Error::Config(format!("cannot encode `{value}`: {e}"));
    let parse_float_err = |e: std::num::ParseFloatError| Error::Config(format!("cannot encode `{value}`: {e}"));

    Ok(match data_type {
        DataType::Uint16 => vec![value.parse::<u16>().map_err(parse_err)?],
        DataType::Int16 => vec![value.parse::<i16>().map_err(|e| Error::Config(e.to_string()))? as u16],
        DataType::Uint32Be => {
            let v = value.parse::<u32>().map_err(parse_err)?;
            vec![(v >> 16) as u16, v as u16]
        }
        DataType::Uint32Le => {
            let v = value.parse::<u32>().map_err(parse_err)?;
            vec![v as u16, (v >> 16) as u16]
        }
        DataType::Int32Be => {
            let v = value.parse::<i32>().map_err(|e| Error::Config(e.to_string()))? as u32;
            vec![(v >> 16) as u16, v as u16]
        }
        DataType::Int32Le => {
            let v = value.parse::<i32>().map_err(|e| Error::Config(e.to_string()))? as u32;
            vec![v as u16, (v >> 16) as u16]
        }
        DataType::Float32Be => {
            let bits = value.parse::<f32>().map_err(parse_float_err)?.to_bits();
            vec![(bits >> 16) as u16, bits as u16]
        }
        DataType::Float32Le => {
            let bits = value.parse::<f32>().map_err(parse_float_err)?.to_bits();
            vec![bits as u16, (bits >> 16) as u16]
        }
        DataType::String => {
            let width = count.unwrap_or(1).max(1) as usize;
            let mut padded = value.as_bytes().to_vec();
            padded.resize(width * 2, b' ');
            padded.chunks(2).map(|c| u16::from_be_bytes([c[0], c[1]])).collect()
        }
    })
}

/// Decode registers read from a device back into the ASCII text surfaced to
/// the VXI-11 client.
pub fn decode_registers(data_type: DataType, regs: &[u16]) -> Result<String> {
    let need = |n: usize| -> Result<()> {
        if regs.len() < n {
            Err(Error::BadResponse(format!(
                "expected at least {n} registers for {data_type:?}, got {}",
                regs.len()
            )))
        } else {
            Ok(())
        }
    };

    Ok(match data_type {
        DataType::Uint16 => {
            need(1)?;
            regs[0].to_string()
        }
        DataType::Int16 => {
            need(1)?;
            (regs[0] as i16).to_string()
        }
        DataType::Uint32Be => {
            need(2)?;
            (((regs[0] as u32) << 16) | regs[1] as u32).to_string()
        }
        DataType::Uint32Le => {
            need(2)?;
            (((regs[1] as u32) << 16) | regs[0] as u32).to_string()
        }
        DataType::Int32Be => {
            need(2)?;
            ((((regs[0] as u32) << 16) | regs[1] as u32) as i32).to_string()
        }
        DataType::Int32Le => {
            need(2)?;
            ((((regs[1] as u32) << 16) | regs[0] as u32) as i32).to_string()
        }
        DataType::Float32Be => {
            need(2)?;
            f32::from_bits(((regs[0] as u32) << 16) | regs[1] as u32).to_string()
        }
        DataType::Float32Le => {
            need(2)?;
            f32::from_bits(((regs[1] as u32) << 16) | regs[0] as u32).to_string()
        }
        DataType::String => {
            let mut bytes = Vec::with_capacity(regs.len() * 2);
            for reg in regs {
                bytes.extend(reg.to_be_bytes());
            }
            String::from_utf8_lossy(&bytes).trim_end().to_string()
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dollar_substitution_fills_in_captures() {
        let captures = vec!["MEAS:TEMP 5".to_string(), "5".to_string()];
        assert_eq!(format_template("set:$1:raw", &captures), "set:5:raw");
    }

    #[test]
    fn unmatched_placeholder_becomes_empty() {
        let captures = vec!["FOO".to_string()];
        assert_eq!(format_template("$3", &captures), "");
    }

    #[test]
    fn float32_be_roundtrips_through_registers() {
        let regs = encode_registers(DataType::Float32Be, "23.5", None).unwrap();
        assert_eq!(decode_registers(DataType::Float32Be, &regs).unwrap(), "23.5");
    }

    #[test]
    fn float32_le_roundtrips_through_registers() {
        let regs = encode_registers(DataType::Float32Le, "-12.25", None).unwrap();
        assert_eq!(decode_registers(DataType::Float32Le, &regs).unwrap(), "-12.25");
    }

    #[test]
    fn uint32_be_vs_le_word_order_differs() {
        let be = encode_registers(DataType::Uint32Be, "0x00010002" , None);
        assert!(be.is_err()); // hex literals are not accepted, only decimal
        let le = encode_registers(DataType::Uint32Le, "65538", None).unwrap();
        assert_eq!(le, vec![2, 1]);
        let be = encode_registers(DataType::Uint32Be, "65538", None).unwrap();
        assert_eq!(be, vec![1, 2]);
    }

    #[test]
    fn string_type_packs_two_ascii_bytes_per_register() {
        let regs = encode_registers(DataType::String, "AB", Some(1)).unwrap();
        assert_eq!(regs, vec![u16::from_be_bytes([b'A', b'B'])]);
        assert_eq!(decode_registers(DataType::String, &regs).unwrap(), "AB");
    }

    #[test]
    fn resolve_value_follows_capture_reference() {
        let captures = vec!["whole".to_string(), "42".to_string()];
        let value = serde_yaml::Value::String("$1".to_string());
        assert_eq!(resolve_value(&value, &captures).unwrap(), "42");
    }

    #[test]
    fn resolve_value_treats_plain_string_as_literal() {
        let captures = vec!["whole".to_string()];
        let value = serde_yaml::Value::String("fixed".to_string());
        assert_eq!(resolve_value(&value, &captures).unwrap(), "fixed");
    }

    #[test]
    fn find_match_returns_first_matching_rule_in_order() {
        let rules = compile(&[
            MappingRuleConfig {
                pattern: "^A.*$".to_string(),
                action: None,
                params: None,
                request_format: Some("first".to_string()),
                response_regex: None,
                response_format: None,
                response: Some("ok".to_string()),
                payload_width: None,
                expects_response: None,
                scale: None,
                terminator: None,
                response_scale: None,
            },
            MappingRuleConfig {
                pattern: "^ABC$".to_string(),
                action: None,
                params: None,
                request_format: Some("second".to_string()),
                response_regex: None,
                response_format: None,
                response: Some("ok".to_string()),
                payload_width: None,
                expects_response: None,
                scale: None,
                terminator: None,
                response_scale: None,
            },
        ])
        .unwrap();

        let (rule, _) = find_match(&rules, "ABC").unwrap();
        assert_eq!(rule.config.request_format.as_deref(), Some("first"));
    }

    #[test]
    fn find_match_rejects_a_rule_that_only_matches_a_substring() {
        let rules = compile(&[MappingRuleConfig {
            pattern: "MEAS:TEMP".to_string(),
            action: None,
            params: None,
            request_format: Some("temp".to_string()),
            response_regex: None,
            response_format: None,
            response: Some("ok".to_string()),
            payload_width: None,
            expects_response: None,
            scale: None,
            terminator: None,
            response_scale: None,
        }])
        .unwrap();

        assert!(find_match(&rules, "XMEAS:TEMPFOO").is_err());
        assert!(find_match(&rules, "MEAS:TEMP").is_ok());
    }
}
