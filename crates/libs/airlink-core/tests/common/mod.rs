#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use airlink_core::iface_table::{DEFAULT_AP_FW_NAME, DEFAULT_AP_STA_FW_NAME, DEFAULT_FW_NAME};
use airlink_core::pool::DataBuffer;
use airlink_core::{
    Adapter, AdapterRef, CardId, Interface, LifecycleController, MacAddr, MemoryFirmwareSource,
    ModuleConfig, PacketSink, SimBehavior, SimSubsystem, Ssid, SsidBssid,
};

pub const FW_IMAGE: &[u8] = &[0x5a; 256];

pub struct Harness {
    pub sim: Arc<SimSubsystem>,
    pub firmware: Arc<MemoryFirmwareSource>,
    pub controller: LifecycleController,
}

impl Harness {
    pub fn new(config: ModuleConfig) -> Self {
        Self::with_behavior(config, SimBehavior::default())
    }

    pub fn with_behavior(config: ModuleConfig, behavior: SimBehavior) -> Self {
        let firmware = Arc::new(
            MemoryFirmwareSource::new()
                .with_image(DEFAULT_FW_NAME, FW_IMAGE)
                .with_image(DEFAULT_AP_FW_NAME, FW_IMAGE)
                .with_image(DEFAULT_AP_STA_FW_NAME, FW_IMAGE),
        );
        Self::with_firmware(config, behavior, firmware)
    }

    pub fn with_firmware(
        config: ModuleConfig,
        behavior: SimBehavior,
        firmware: Arc<MemoryFirmwareSource>,
    ) -> Self {
        let sim = Arc::new(SimSubsystem::with_behavior(behavior));
        let controller =
            LifecycleController::new(config, sim.clone(), firmware.clone()).expect("valid config");
        Self {
            sim,
            firmware,
            controller,
        }
    }

    pub fn attach(&self, card: u32) -> Arc<Adapter> {
        self.controller.add_card(CardId(card)).expect("add card")
    }
}

pub fn config(toml: &str) -> ModuleConfig {
    ModuleConfig::from_toml(toml).expect("config")
}

pub fn adapter_ref(adapter: &Adapter) -> AdapterRef {
    adapter.adapter_ref().expect("registered")
}

pub fn iface(adapter: &Adapter, name: &str) -> Arc<Interface> {
    adapter
        .interface_by_name(name)
        .unwrap_or_else(|| panic!("no interface {name}"))
}

pub fn names(adapter: &Adapter) -> Vec<String> {
    adapter
        .interfaces()
        .iter()
        .map(|iface| iface.name().to_string())
        .collect()
}

pub fn network(ssid: &str, last: u8) -> SsidBssid {
    SsidBssid::new(
        ssid.parse::<Ssid>().expect("ssid"),
        MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, last]),
    )
}

pub fn ipv4_frame(len: usize) -> Vec<u8> {
    let mut frame = vec![0u8; len];
    frame[12] = 0x08;
    frame[13] = 0x00;
    frame
}

/// Polls `check` until it holds or `timeout` elapses.
pub fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Packet sink that records what it was handed.
#[derive(Default)]
pub struct RecordingSink {
    pub frames: Mutex<Vec<(String, Vec<u8>)>>,
}

impl PacketSink for RecordingSink {
    fn deliver(&self, ifname: &str, frame: DataBuffer) {
        self.frames
            .lock()
            .expect("frames")
            .push((ifname.to_string(), frame.data().to_vec()));
    }
}
