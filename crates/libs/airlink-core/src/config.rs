use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WlanError;
use crate::iface_table::{DriverMode, RoleCounts};
use crate::types::MacAddr;

/// Transmit buffer sizes the firmware accepts. `0` keeps the firmware default.
pub const VALID_MAX_TX_BUF: [u32; 4] = [0, 2048, 4096, 8192];

/// Upper bound for a single request payload allocation.
pub const DEFAULT_MAX_REQUEST_PAYLOAD: usize = 64 * 1024;

/// Module-wide load parameters. Every field is optional in TOML.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    /// Firmware image name overriding the mode-derived default.
    pub fw_name: Option<String>,
    /// Fetch the firmware image asynchronously and finish attach in the
    /// completion callback.
    pub req_fw_nowait: bool,
    pub fw_crc_check: bool,
    /// Bitmask of enabled roles: 1 = station, 2 = access point, 4 = Wi-Fi Direct.
    pub drv_mode: u32,
    pub max_sta_bss: i32,
    pub max_uap_bss: i32,
    pub max_wfd_bss: i32,
    /// MAC address applied to the first station interface.
    pub mac_addr: Option<String>,
    pub auto_ds: u32,
    pub ps_mode: u32,
    pub max_tx_buf: u32,
    pub cfg_11d: u32,
    /// Name of the init configuration file, resolved through the firmware source.
    pub init_cfg: Option<String>,
    /// Name of the calibration data file, resolved through the firmware source.
    pub cal_data_cfg: Option<String>,
    /// Arm the reassociation supervisor when a station loses its link.
    pub reassoc: bool,
    pub fw_request_timeout_secs: u64,
    pub fw_retry_interval_ms: u64,
    pub fw_init_timeout_ms: u64,
    pub reassoc_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// A transmit queue stopped on backlog for this long counts as a tx timeout.
    pub tx_watchdog_ms: u64,
    /// Blocking requests give up after this long. Unset waits until completion
    /// or removal.
    pub ioctl_timeout_ms: Option<u64>,
    pub max_request_payload: usize,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            fw_name: None,
            req_fw_nowait: false,
            fw_crc_check: true,
            drv_mode: DriverMode::STA | DriverMode::UAP,
            max_sta_bss: RoleCounts::DEFAULT.sta,
            max_uap_bss: RoleCounts::DEFAULT.uap,
            max_wfd_bss: RoleCounts::DEFAULT.wfd,
            mac_addr: None,
            auto_ds: 0,
            ps_mode: 0,
            max_tx_buf: 0,
            cfg_11d: 0,
            init_cfg: None,
            cal_data_cfg: None,
            reassoc: true,
            fw_request_timeout_secs: 10,
            fw_retry_interval_ms: 1000,
            fw_init_timeout_ms: 10_000,
            reassoc_interval_ms: 10_000,
            shutdown_timeout_ms: 5_000,
            tx_watchdog_ms: 10_000,
            ioctl_timeout_ms: None,
            max_request_payload: DEFAULT_MAX_REQUEST_PAYLOAD,
        }
    }
}

impl ModuleConfig {
    pub fn from_toml(input: &str) -> Result<Self, WlanError> {
        let config: Self = toml::from_str(input).map_err(|err| WlanError::config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, WlanError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|err| WlanError::config(format!("{}: {err}", path.display())))?;
        Self::from_toml(&contents)
    }

    /// Rejects parameter combinations no adapter can be attached with.
    /// Out-of-range role counts are not errors here; the interface table
    /// clamps them.
    pub fn validate(&self) -> Result<(), WlanError> {
        let mode = self.driver_mode()?;
        if mode.is_empty() {
            return Err(WlanError::config("drv_mode enables no role"));
        }
        if !VALID_MAX_TX_BUF.contains(&self.max_tx_buf) {
            return Err(WlanError::config(format!(
                "max_tx_buf {} not one of {VALID_MAX_TX_BUF:?}",
                self.max_tx_buf
            )));
        }
        if self.auto_ds > 2 {
            return Err(WlanError::config(format!("auto_ds {} out of range 0..=2", self.auto_ds)));
        }
        if self.ps_mode > 2 {
            return Err(WlanError::config(format!("ps_mode {} out of range 0..=2", self.ps_mode)));
        }
        if self.cfg_11d > 2 {
            return Err(WlanError::config(format!("cfg_11d {} out of range 0..=2", self.cfg_11d)));
        }
        self.mac_override()?;
        if let Some(name) = self.fw_name.as_deref() {
            if name.trim().is_empty() {
                return Err(WlanError::config("fw_name is empty"));
            }
        }
        if self.fw_retry_interval_ms == 0 {
            return Err(WlanError::config("fw_retry_interval_ms must be non-zero"));
        }
        if self.reassoc_interval_ms == 0 {
            return Err(WlanError::config("reassoc_interval_ms must be non-zero"));
        }
        if self.tx_watchdog_ms == 0 {
            return Err(WlanError::config("tx_watchdog_ms must be non-zero"));
        }
        if self.max_request_payload == 0 {
            return Err(WlanError::config("max_request_payload must be non-zero"));
        }
        Ok(())
    }

    pub fn driver_mode(&self) -> Result<DriverMode, WlanError> {
        DriverMode::from_bits(self.drv_mode)
    }

    pub fn role_counts(&self) -> RoleCounts {
        RoleCounts {
            sta: self.max_sta_bss,
            uap: self.max_uap_bss,
            wfd: self.max_wfd_bss,
        }
    }

    pub fn mac_override(&self) -> Result<Option<MacAddr>, WlanError> {
        self.mac_addr.as_deref().map(str::parse).transpose()
    }

    pub fn fw_request_timeout(&self) -> Duration {
        Duration::from_secs(self.fw_request_timeout_secs)
    }

    pub fn fw_retry_interval(&self) -> Duration {
        Duration::from_millis(self.fw_retry_interval_ms)
    }

    pub fn fw_init_timeout(&self) -> Duration {
        Duration::from_millis(self.fw_init_timeout_ms)
    }

    pub fn reassoc_interval(&self) -> Duration {
        Duration::from_millis(self.reassoc_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn tx_watchdog(&self) -> Duration {
        Duration::from_millis(self.tx_watchdog_ms)
    }

    pub fn ioctl_timeout(&self) -> Option<Duration> {
        self.ioctl_timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = ModuleConfig::from_toml("").expect("parse");
        assert_eq!(config, ModuleConfig::default());
        assert_eq!(config.fw_request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn rejects_bad_max_tx_buf() {
        let err = ModuleConfig::from_toml("max_tx_buf = 1000").expect_err("invalid");
        assert!(matches!(err, WlanError::ConfigurationInvalid { .. }));
    }

    #[test]
    fn zero_intervals_are_rejected() {
        assert!(ModuleConfig::from_toml("reassoc_interval_ms = 0").is_err());
        assert!(ModuleConfig::from_toml("tx_watchdog_ms = 0").is_err());
        let config = ModuleConfig::from_toml("tx_watchdog_ms = 250").expect("parse");
        assert_eq!(config.tx_watchdog(), Duration::from_millis(250));
    }

    #[test]
    fn rejects_unknown_keys() {
        assert!(ModuleConfig::from_toml("drv_mod = 1").is_err());
    }

    #[test]
    fn rejects_empty_driver_mode() {
        assert!(ModuleConfig::from_toml("drv_mode = 0").is_err());
        assert!(ModuleConfig::from_toml("drv_mode = 8").is_err());
    }

    #[test]
    fn mac_override_is_validated() {
        assert!(ModuleConfig::from_toml("mac_addr = \"00:50:43:21:0a:0b\"").is_ok());
        assert!(ModuleConfig::from_toml("mac_addr = \"00:50:43\"").is_err());
    }
}
