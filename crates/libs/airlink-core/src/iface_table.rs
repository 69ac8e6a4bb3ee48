//! Interface table: the ordered list of virtual interfaces an adapter hosts,
//! plus the firmware image that supports that role combination.

use log::{error, warn};
use serde::Serialize;

use crate::config::ModuleConfig;
use crate::error::WlanError;
use crate::types::{BssType, FrameType};

pub const DEFAULT_FW_NAME: &str = "mrvl/sd8787.bin";
pub const DEFAULT_AP_FW_NAME: &str = "mrvl/sd8787_ap.bin";
pub const DEFAULT_AP_STA_FW_NAME: &str = "mrvl/sd8787_uapsta.bin";

/// Hard cap on interfaces per adapter, across all roles.
pub const MAX_BSS_NUM: usize = 16;

/// Enabled roles. Built from the `drv_mode` bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DriverMode {
    pub sta: bool,
    pub uap: bool,
    pub wfd: bool,
}

impl DriverMode {
    pub const STA: u32 = 0x01;
    pub const UAP: u32 = 0x02;
    pub const WFD: u32 = 0x04;
    const ALL: u32 = Self::STA | Self::UAP | Self::WFD;

    pub fn from_bits(bits: u32) -> Result<Self, WlanError> {
        if bits & !Self::ALL != 0 {
            return Err(WlanError::config(format!("drv_mode {bits:#x} has unknown bits")));
        }
        Ok(Self {
            sta: bits & Self::STA != 0,
            uap: bits & Self::UAP != 0,
            wfd: bits & Self::WFD != 0,
        })
    }

    pub fn bits(self) -> u32 {
        let mut bits = 0;
        if self.sta {
            bits |= Self::STA;
        }
        if self.uap {
            bits |= Self::UAP;
        }
        if self.wfd {
            bits |= Self::WFD;
        }
        bits
    }

    pub fn is_empty(self) -> bool {
        !(self.sta || self.uap || self.wfd)
    }
}

/// Requested interface count per role. Counts for disabled roles are ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    pub sta: i32,
    pub uap: i32,
    pub wfd: i32,
}

impl RoleCounts {
    pub const DEFAULT: RoleCounts = RoleCounts { sta: 1, uap: 1, wfd: 1 };
}

impl Default for RoleCounts {
    fn default() -> Self {
        Self::DEFAULT
    }
}

/// Per-role and global bounds applied by [`InterfaceTable::build`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TableLimits {
    pub max: RoleCounts,
    pub defaults: RoleCounts,
    pub max_total: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            max: RoleCounts { sta: 2, uap: 2, wfd: 1 },
            defaults: RoleCounts::DEFAULT,
            max_total: MAX_BSS_NUM,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceEntry {
    /// Position in the table; also the adapter slot and bss index.
    pub slot: u8,
    pub bss_type: BssType,
    #[serde(skip)]
    pub frame_type: FrameType,
    pub priority: u8,
    /// Ordinal of this entry among entries of the same role.
    pub bss_num: u8,
    pub active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct InterfaceTable {
    pub mode: DriverMode,
    /// Counts after clamping; zero for disabled roles.
    pub counts: RoleCounts,
    pub entries: Vec<InterfaceEntry>,
    pub fw_name: String,
}

fn clamp_count(role: &str, requested: i32, max: i32, default: i32) -> i32 {
    if requested < 1 || requested > max {
        warn!("iface_table: unsupported max_{role}_bss ({requested}), using default {default}");
        default
    } else {
        requested
    }
}

impl InterfaceTable {
    /// Builds the table for `mode`. Either the whole table is returned or
    /// nothing is; no partial table escapes on failure.
    pub fn build(
        mode: DriverMode,
        requested: RoleCounts,
        fw_override: Option<&str>,
        limits: &TableLimits,
    ) -> Result<Self, WlanError> {
        let counts = RoleCounts {
            sta: if mode.sta {
                clamp_count("sta", requested.sta, limits.max.sta, limits.defaults.sta)
            } else {
                0
            },
            uap: if mode.uap {
                clamp_count("uap", requested.uap, limits.max.uap, limits.defaults.uap)
            } else {
                0
            },
            wfd: if mode.wfd {
                clamp_count("wfd", requested.wfd, limits.max.wfd, limits.defaults.wfd)
            } else {
                0
            },
        };

        let total = [counts.sta, counts.uap, counts.wfd]
            .iter()
            .map(|n| usize::try_from(*n).unwrap_or(0))
            .sum::<usize>();
        // Slots are bss indexes; the firmware addresses at most MAX_BSS_NUM.
        let cap = limits.max_total.min(MAX_BSS_NUM);
        if total == 0 || total > cap {
            error!("iface_table: unsupported number of interfaces {total}");
            return Err(WlanError::config(format!(
                "interface count {total} outside 1..={cap}"
            )));
        }

        let mut entries = Vec::with_capacity(total);
        for (bss_type, count) in [
            (BssType::Sta, counts.sta),
            (BssType::Uap, counts.uap),
            (BssType::Wfd, counts.wfd),
        ] {
            for bss_num in 0..count {
                let slot = entries.len();
                let slot = u8::try_from(slot)
                    .map_err(|_| WlanError::config(format!("slot {slot} out of range")))?;
                let bss_num = u8::try_from(bss_num).map_err(|_| {
                    WlanError::config(format!("{bss_type} bss_num {bss_num} out of range"))
                })?;
                entries.push(InterfaceEntry {
                    slot,
                    bss_type,
                    frame_type: FrameType::EthII,
                    priority: 0,
                    bss_num,
                    active: true,
                });
            }
        }

        let fw_name = match fw_override {
            Some(name) => name.to_string(),
            None => default_fw_name(mode).to_string(),
        };

        Ok(Self {
            mode,
            counts,
            entries,
            fw_name,
        })
    }

    pub fn from_config(config: &ModuleConfig, limits: &TableLimits) -> Result<Self, WlanError> {
        Self::build(
            config.driver_mode()?,
            config.role_counts(),
            config.fw_name.as_deref(),
            limits,
        )
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, slot: usize) -> Option<&InterfaceEntry> {
        self.entries.get(slot)
    }
}

/// Image supporting the enabled role combination. Wi-Fi Direct runs on the
/// station firmware.
pub fn default_fw_name(mode: DriverMode) -> &'static str {
    let station = mode.sta || mode.wfd;
    match (station, mode.uap) {
        (true, true) => DEFAULT_AP_STA_FW_NAME,
        (false, true) => DEFAULT_AP_FW_NAME,
        _ => DEFAULT_FW_NAME,
    }
}
