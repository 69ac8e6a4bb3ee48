use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::WlanError;

pub const ETH_ALEN: usize = 6;
/// Maximum Ethernet frame length accepted for transmit, header included.
pub const ETH_FRAME_LEN: usize = 1514;
pub const IFNAMSIZ: usize = 16;
pub const MAX_SSID_LEN: usize = 32;

/// 48-bit IEEE MAC address.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; ETH_ALEN]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; ETH_ALEN]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; ETH_ALEN]);

    pub fn octets(&self) -> [u8; ETH_ALEN] {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0; ETH_ALEN]
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl FromStr for MacAddr {
    type Err = WlanError;

    /// Parses `aa:bb:cc:dd:ee:ff`. `-` is accepted as a separator as well.
    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; ETH_ALEN];
        let mut parts = input.trim().split(|c: char| c == ':' || c == '-');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| WlanError::config(format!("mac address too short: {input}")))?;
            let bytes = hex::decode(part)
                .map_err(|err| WlanError::config(format!("mac address {input}: {err}")))?;
            match bytes.as_slice() {
                [b] => *octet = *b,
                _ => {
                    return Err(WlanError::config(format!(
                        "mac address octet {part:?} is not one byte"
                    )))
                }
            }
        }
        if parts.next().is_some() {
            return Err(WlanError::config(format!("mac address too long: {input}")));
        }
        Ok(MacAddr(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

/// Network name, at most 32 octets, not necessarily UTF-8.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ssid(Vec<u8>);

impl Ssid {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self, WlanError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_SSID_LEN {
            return Err(WlanError::config(format!(
                "ssid is {} bytes, max {MAX_SSID_LEN}",
                bytes.len()
            )));
        }
        Ok(Self(bytes))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromStr for Ssid {
    type Err = WlanError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Self::new(input.as_bytes())
    }
}

impl fmt::Display for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for Ssid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ssid({:?})", String::from_utf8_lossy(&self.0))
    }
}

/// A network identified by name and access point address.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsidBssid {
    pub ssid: Ssid,
    pub bssid: MacAddr,
}

impl SsidBssid {
    pub fn new(ssid: Ssid, bssid: MacAddr) -> Self {
        Self { ssid, bssid }
    }
}

/// Role an interface plays towards the firmware.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BssRole {
    Sta,
    Uap,
}

/// Kind of virtual interface a slot hosts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BssType {
    Sta,
    Uap,
    Wfd,
}

impl BssType {
    /// Wi-Fi Direct interfaces run the station role until negotiated otherwise.
    pub fn role(self) -> BssRole {
        match self {
            BssType::Sta | BssType::Wfd => BssRole::Sta,
            BssType::Uap => BssRole::Uap,
        }
    }

    /// Interface name prefix, completed with the lowest free index.
    pub fn name_prefix(self) -> &'static str {
        match self {
            BssType::Sta => "mlan",
            BssType::Uap => "uap",
            BssType::Wfd => "wfd",
        }
    }
}

impl fmt::Display for BssType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BssType::Sta => "sta",
            BssType::Uap => "uap",
            BssType::Wfd => "wfd",
        })
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BssMode {
    #[default]
    Infra,
    Ibss,
    Auto,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    #[default]
    EthII,
    Ieee8022,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_and_formats() {
        let mac: MacAddr = "AA:bb:0c:DD:ee:0F".parse().expect("mac");
        assert_eq!(mac.0, [0xaa, 0xbb, 0x0c, 0xdd, 0xee, 0x0f]);
        assert_eq!(mac.to_string(), "aa:bb:0c:dd:ee:0f");
        assert!(!mac.is_zero());
    }

    #[test]
    fn mac_rejects_malformed_input() {
        for input in [
            "",
            "aa:bb:cc",
            "aa:bb:cc:dd:ee:ff:00",
            "aa:bb:cc:dd:ee:fg",
            "aaa:bb:cc:dd:ee:ff",
        ] {
            assert!(input.parse::<MacAddr>().is_err(), "{input} should be rejected");
        }
    }

    #[test]
    fn ssid_length_is_bounded() {
        assert!(Ssid::new(vec![b'a'; MAX_SSID_LEN]).is_ok());
        assert!(Ssid::new(vec![b'a'; MAX_SSID_LEN + 1]).is_err());
    }

    #[test]
    fn wfd_runs_station_role() {
        assert_eq!(BssType::Wfd.role(), BssRole::Sta);
        assert_eq!(BssType::Uap.role(), BssRole::Uap);
        assert_eq!(BssType::Wfd.name_prefix(), "wfd");
    }
}
