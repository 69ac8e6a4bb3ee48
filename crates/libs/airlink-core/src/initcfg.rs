//! Text formats applied after the adapter becomes ready: the init config
//! (`mac_addr=` and `wlan_reg=` directives) and ASCII-hex calibration data.

use log::debug;
use serde::Serialize;

use crate::dispatch::MAX_REG_TYPE;
use crate::error::WlanError;
use crate::types::MacAddr;

/// Longest accepted interface name or numeric field.
const MAX_PARAM_LEN: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum InitDirective {
    /// Assign `mac` to every interface named `ifname`.
    MacAddr { ifname: String, mac: MacAddr },
    /// Register write issued through the first interface.
    RegWrite { reg_type: u8, offset: u32, value: u32 },
}

fn line_error(line: usize, message: impl std::fmt::Display) -> WlanError {
    WlanError::config(format!("init config line {line}: {message}"))
}

/// Decimal, or hexadecimal with a `0x`/`0X` prefix.
pub fn parse_number(field: &str) -> Option<u32> {
    match field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => field.parse().ok(),
    }
}

fn parse_mac_line(rest: &str, line: usize) -> Result<InitDirective, WlanError> {
    let (_, assignment) = rest
        .split_once('=')
        .ok_or_else(|| line_error(line, "mac_addr without '='"))?;
    let (ifname, mac) = assignment
        .split_once(':')
        .ok_or_else(|| line_error(line, "mac_addr without interface name"))?;
    if ifname.is_empty() || ifname.len() > MAX_PARAM_LEN {
        return Err(line_error(line, format!("bad interface name {ifname:?}")));
    }
    let mac = mac.parse().map_err(|err| line_error(line, err))?;
    Ok(InitDirective::MacAddr {
        ifname: ifname.to_string(),
        mac,
    })
}

fn parse_reg_line(rest: &str, line: usize) -> Result<InitDirective, WlanError> {
    let (_, assignment) = rest
        .split_once('=')
        .ok_or_else(|| line_error(line, "wlan_reg without '='"))?;
    let fields: Vec<&str> = assignment.splitn(3, ',').collect();
    let [reg_type, offset, value] = fields.as_slice() else {
        return Err(line_error(line, "wlan_reg expects <type>,<offset>,<value>"));
    };
    for field in [offset, value] {
        if field.len() >= MAX_PARAM_LEN {
            return Err(line_error(line, "register field too long"));
        }
    }
    let reg_type = parse_number(reg_type)
        .and_then(|t| u8::try_from(t).ok())
        .filter(|t| *t <= MAX_REG_TYPE)
        .ok_or_else(|| line_error(line, format!("unsupported register type {reg_type:?}")))?;
    let offset =
        parse_number(offset).ok_or_else(|| line_error(line, format!("bad offset {offset:?}")))?;
    let value =
        parse_number(value).ok_or_else(|| line_error(line, format!("bad value {value:?}")))?;
    Ok(InitDirective::RegWrite {
        reg_type,
        offset,
        value,
    })
}

/// Parses an init config. Spaces and tabs are removed from every line;
/// blank lines, `#` comments and unknown keys are skipped. A malformed
/// `mac_addr`/`wlan_reg` line fails the whole file.
pub fn parse_init_cfg(text: &str) -> Result<Vec<InitDirective>, WlanError> {
    let mut directives = Vec::new();
    for (index, raw) in text.split('\n').enumerate() {
        let line = index + 1;
        let stripped: String = raw
            .chars()
            .filter(|c| !matches!(c, ' ' | '\t' | '\r'))
            .collect();
        if stripped.is_empty() || stripped.starts_with('#') {
            continue;
        }
        if stripped.starts_with("mac_addr") {
            directives.push(parse_mac_line(&stripped, line)?);
        } else if stripped.starts_with("wlan_reg") {
            directives.push(parse_reg_line(&stripped, line)?);
        } else {
            debug!("initcfg: line {line} ignored");
        }
    }
    Ok(directives)
}

/// Converts ASCII-hex calibration text to bytes. Whitespace separates
/// tokens; within a token every pair of hex digits is one byte and other
/// characters are skipped.
pub fn parse_cal_data(text: &[u8]) -> Result<Vec<u8>, WlanError> {
    let mut bytes = Vec::new();
    for (index, token) in text.split(|b| b.is_ascii_whitespace()).enumerate() {
        let digits: Vec<u8> = token.iter().copied().filter(u8::is_ascii_hexdigit).collect();
        if digits.is_empty() {
            continue;
        }
        let decoded = hex::decode(&digits)
            .map_err(|err| WlanError::config(format!("calibration token {index}: {err}")))?;
        bytes.extend_from_slice(&decoded);
    }
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mac_and_register_directives() {
        let text = "# board defaults\n\
                    mac_addr = mlan0: 00:50:43:21:0a:0b\r\n\
                    \n\
                    wlan_reg=1,0x40,10\n\
                    txpower=12\n";
        let directives = parse_init_cfg(text).expect("parse");
        assert_eq!(
            directives,
            vec![
                InitDirective::MacAddr {
                    ifname: "mlan0".to_string(),
                    mac: MacAddr([0x00, 0x50, 0x43, 0x21, 0x0a, 0x0b]),
                },
                InitDirective::RegWrite {
                    reg_type: 1,
                    offset: 0x40,
                    value: 10,
                },
            ]
        );
    }

    #[test]
    fn mac_line_splits_on_first_colon() {
        let directives = parse_init_cfg("mac_addr=uap0:AA:BB:CC:DD:EE:FF").expect("parse");
        assert_eq!(
            directives,
            vec![InitDirective::MacAddr {
                ifname: "uap0".to_string(),
                mac: MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]),
            }]
        );
    }

    #[test]
    fn malformed_lines_report_line_number() {
        let err = parse_init_cfg("# x\nmac_addr=mlan0").expect_err("no colon");
        assert!(err.to_string().contains("line 2"), "{err}");
        assert!(parse_init_cfg("wlan_reg=5,0x10,1").is_err());
        assert!(parse_init_cfg("wlan_reg=1,0x10").is_err());
        assert!(parse_init_cfg("wlan_reg=1,zz,1").is_err());
        assert!(parse_init_cfg("mac_addr=mlan0:00:11").is_err());
    }

    #[test]
    fn numbers_accept_hex_and_decimal() {
        assert_eq!(parse_number("0x1F"), Some(31));
        assert_eq!(parse_number("0XfF"), Some(255));
        assert_eq!(parse_number("42"), Some(42));
        assert_eq!(parse_number("0xFFFFFFFF"), Some(u32::MAX));
        assert_eq!(parse_number("-1"), None);
        assert_eq!(parse_number(""), None);
    }

    #[test]
    fn calibration_hex_is_decoded() {
        let bytes = parse_cal_data(b"01 0a\tFF\n  7e\r\nA0B1").expect("parse");
        assert_eq!(bytes, vec![0x01, 0x0a, 0xff, 0x7e, 0xa0, 0xb1]);
        assert!(parse_cal_data(b"abc").is_err());
        assert!(parse_cal_data(b"  \n").expect("empty").is_empty());
    }
}
