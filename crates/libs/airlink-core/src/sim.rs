//! Simulated adapter subsystem.
//!
//! Answers every request from a scriptable [`SimBehavior`] so the lifecycle,
//! dispatch and reassociation paths can run without hardware. Completions
//! that the behavior defers are delivered from short-lived threads through
//! the registered [`HostCallbacks`], like interrupt-driven completions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, trace};

use crate::dispatch::{BssInfo, FwInfo, IoctlCommand, IoctlResponse, RequestHandle};
use crate::error::WlanError;
use crate::pool::{DataBuffer, HostLock, HostTimer, PooledBytes};
use crate::subsystem::{
    AdapterEvent, AdapterRef, AdapterSubsystem, DeviceDescriptor, FirmwareImage, HostCallbacks,
    OpStatus, RequestStatus,
};
use crate::sync::lock;
use crate::types::{BssMode, MacAddr, SsidBssid};

/// Bytes of host memory each simulated adapter holds while registered.
const SCRATCH_LEN: usize = 64;

/// How firmware init or shutdown completes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimCompletion {
    #[default]
    Immediate,
    /// `Pending`, then the completion callback after the delay.
    Deferred(Duration),
    /// `Pending` and no callback unless one is triggered by hand.
    Never,
    Fail,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimRequests {
    #[default]
    Immediate,
    Deferred(Duration),
    /// Held until [`SimSubsystem::release_held_requests`] or unregister.
    Hold,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SimSend {
    #[default]
    Immediate,
    /// Held until [`SimSubsystem::complete_pending_sends`].
    Hold,
}

#[derive(Clone, Debug)]
pub struct SimBehavior {
    pub reject_register: bool,
    pub reject_download: bool,
    pub init: SimCompletion,
    pub shutdown: SimCompletion,
    pub requests: SimRequests,
    pub send: SimSend,
    /// Networks visible to scans.
    pub scan_table: Vec<SsidBssid>,
    pub fail_scan: bool,
    pub join_succeeds: bool,
    /// Interfaces whose MAC address changes are refused.
    pub reject_mac_for: Vec<u8>,
    pub bss_mode: BssMode,
    pub wep_enabled: bool,
    pub deep_sleep: bool,
    pub hs_configured: bool,
    /// Permanent address of interface 0; interface `n` reports it plus `n`.
    pub fw_mac: MacAddr,
    pub fw_version: u32,
    /// Period of the housekeeping timer armed at registration. `None`
    /// leaves it disarmed.
    pub timer_period: Option<Duration>,
    /// Keep the housekeeping timer alive past unregister.
    pub leak_timer: bool,
}

impl Default for SimBehavior {
    fn default() -> Self {
        Self {
            reject_register: false,
            reject_download: false,
            init: SimCompletion::Immediate,
            shutdown: SimCompletion::Immediate,
            requests: SimRequests::Immediate,
            send: SimSend::Immediate,
            scan_table: Vec::new(),
            fail_scan: false,
            join_succeeds: true,
            reject_mac_for: Vec::new(),
            bss_mode: BssMode::Infra,
            wep_enabled: false,
            deep_sleep: false,
            hs_configured: false,
            fw_mac: MacAddr([0x00, 0x50, 0x43, 0x21, 0x00, 0x10]),
            fw_version: 0x0e26_0100,
            timer_period: None,
            leak_timer: false,
        }
    }
}

struct SimAdapter {
    device: DeviceDescriptor,
    callbacks: Arc<dyn HostCallbacks>,
    links: HashMap<u8, SsidBssid>,
    held_requests: Vec<RequestHandle>,
    held_sends: Vec<DataBuffer>,
    /// Adapter-private state allocated through the host at registration.
    _scratch: PooledBytes,
    host_lock: Arc<HostLock>,
    timer: HostTimer,
}

#[derive(Default)]
pub struct SimSubsystem {
    behavior: Mutex<SimBehavior>,
    next_ref: AtomicU64,
    adapters: Mutex<HashMap<u64, SimAdapter>>,
    journal: Mutex<Vec<(u8, IoctlCommand)>>,
    downloads: Mutex<Vec<String>>,
    registered: AtomicU64,
    unregistered: AtomicU64,
    interrupts: AtomicU64,
    main_passes: AtomicU64,
    timer_ticks: Arc<AtomicU64>,
    leaked_timers: Mutex<Vec<HostTimer>>,
}

impl SimSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_behavior(behavior: SimBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            ..Self::default()
        }
    }

    pub fn update(&self, change: impl FnOnce(&mut SimBehavior)) {
        change(&mut lock(&self.behavior));
    }

    pub fn behavior(&self) -> SimBehavior {
        lock(&self.behavior).clone()
    }

    /// Every request seen so far as `(bss_index, command)`.
    pub fn journal(&self) -> Vec<(u8, IoctlCommand)> {
        lock(&self.journal).clone()
    }

    /// Requests named `name` (see [`IoctlCommand::name`]).
    pub fn count(&self, name: &str) -> usize {
        lock(&self.journal)
            .iter()
            .filter(|(_, command)| command.name() == name)
            .count()
    }

    pub fn clear_journal(&self) {
        lock(&self.journal).clear();
    }

    /// Names of downloaded firmware images, in order.
    pub fn downloads(&self) -> Vec<String> {
        lock(&self.downloads).clone()
    }

    pub fn registered(&self) -> u64 {
        self.registered.load(Ordering::SeqCst)
    }

    pub fn unregistered(&self) -> u64 {
        self.unregistered.load(Ordering::SeqCst)
    }

    pub fn interrupts(&self) -> u64 {
        self.interrupts.load(Ordering::SeqCst)
    }

    pub fn main_process_runs(&self) -> u64 {
        self.main_passes.load(Ordering::SeqCst)
    }

    /// Housekeeping timer expiries across every adapter.
    pub fn timer_ticks(&self) -> u64 {
        self.timer_ticks.load(Ordering::SeqCst)
    }

    /// Drops timers kept alive by [`SimBehavior::leak_timer`].
    pub fn release_leaked_timers(&self) -> usize {
        let leaked = std::mem::take(&mut *lock(&self.leaked_timers));
        leaked.len()
    }

    /// Adapters currently registered.
    pub fn live_adapters(&self) -> Vec<AdapterRef> {
        let mut refs: Vec<_> = lock(&self.adapters).keys().copied().map(AdapterRef).collect();
        refs.sort_by_key(|r| r.0);
        refs
    }

    pub fn device(&self, adapter: AdapterRef) -> Option<DeviceDescriptor> {
        lock(&self.adapters).get(&adapter.0).map(|sim| sim.device.clone())
    }

    pub fn held_requests(&self) -> usize {
        lock(&self.adapters).values().map(|sim| sim.held_requests.len()).sum()
    }

    fn callbacks(&self, adapter: AdapterRef) -> Result<Arc<dyn HostCallbacks>, WlanError> {
        lock(&self.adapters)
            .get(&adapter.0)
            .map(|sim| Arc::clone(&sim.callbacks))
            .ok_or_else(|| WlanError::not_found(format!("sim adapter {}", adapter.0)))
    }

    /// Delivers `event` for interface `bss_index`.
    pub fn emit_event(
        &self,
        adapter: AdapterRef,
        bss_index: u8,
        event: AdapterEvent,
    ) -> Result<(), WlanError> {
        let callbacks = self.callbacks(adapter)?;
        if matches!(event, AdapterEvent::LinkLost) {
            if let Some(sim) = lock(&self.adapters).get_mut(&adapter.0) {
                sim.links.remove(&bss_index);
            }
        }
        callbacks.recv_event(bss_index, event);
        Ok(())
    }

    /// Receives `frame` on interface `bss_index`.
    pub fn inject_rx(
        &self,
        adapter: AdapterRef,
        bss_index: u8,
        frame: &[u8],
    ) -> Result<(), WlanError> {
        let callbacks = self.callbacks(adapter)?;
        let mut buffer = callbacks.alloc_buffer(frame.len())?;
        buffer.data_mut().copy_from_slice(frame);
        buffer.bss_index = bss_index;
        callbacks.recv_packet(bss_index, buffer)
    }

    /// Hands every held transmit buffer back as sent.
    pub fn complete_pending_sends(&self, adapter: AdapterRef) -> usize {
        let (callbacks, sends) = {
            let mut adapters = lock(&self.adapters);
            let Some(sim) = adapters.get_mut(&adapter.0) else {
                return 0;
            };
            (Arc::clone(&sim.callbacks), std::mem::take(&mut sim.held_sends))
        };
        let count = sends.len();
        for buffer in sends {
            callbacks.send_packet_complete(buffer, Ok(()));
        }
        count
    }

    /// Completes every held request with its scripted response, or with
    /// `error` when given.
    pub fn release_held_requests(&self, error: Option<WlanError>) -> usize {
        let held: Vec<(u64, RequestHandle)> = lock(&self.adapters)
            .iter_mut()
            .flat_map(|(id, sim)| {
                std::mem::take(&mut sim.held_requests)
                    .into_iter()
                    .map(move |handle| (*id, handle))
            })
            .collect();
        let count = held.len();
        for (id, handle) in held {
            let result = match &error {
                Some(err) => Err(err.clone()),
                None => {
                    let request = handle.request();
                    self.respond(AdapterRef(id), request.bss_index(), request.command())
                }
            };
            let _ = handle.complete(result);
        }
        count
    }

    /// Fires the init-complete callback by hand, for [`SimCompletion::Never`].
    pub fn complete_init(
        &self,
        adapter: AdapterRef,
        result: Result<(), WlanError>,
    ) -> Result<(), WlanError> {
        self.callbacks(adapter)?.init_fw_complete(result);
        Ok(())
    }

    fn respond(
        &self,
        adapter: AdapterRef,
        bss_index: u8,
        command: &IoctlCommand,
    ) -> Result<IoctlResponse, WlanError> {
        let mut behavior = lock(&self.behavior);
        match command {
            IoctlCommand::GetFwInfo => {
                let mut mac = behavior.fw_mac;
                mac.0[5] = mac.0[5].wrapping_add(bss_index);
                Ok(IoctlResponse::FwInfo(FwInfo {
                    fw_version: behavior.fw_version,
                    mac,
                }))
            }
            IoctlCommand::SetMacAddress(mac) => {
                if behavior.reject_mac_for.contains(&bss_index) {
                    return Err(WlanError::subsystem(format!("bss {bss_index}: mac {mac} refused")));
                }
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::Scan { .. } => {
                if behavior.fail_scan {
                    return Err(WlanError::subsystem("scan failed"));
                }
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::FindBestNetwork(target) => {
                let found = if target.bssid.is_zero() {
                    behavior.scan_table.iter().find(|net| net.ssid == target.ssid)
                } else {
                    behavior.scan_table.iter().find(|net| net.bssid == target.bssid)
                };
                found
                    .cloned()
                    .map(IoctlResponse::Network)
                    .ok_or_else(|| WlanError::not_found(format!("network {}", target.ssid)))
            }
            IoctlCommand::BssStart(network) => {
                if !behavior.join_succeeds {
                    return Err(WlanError::subsystem(format!("join {} failed", network.bssid)));
                }
                let joined = behavior
                    .scan_table
                    .iter()
                    .find(|net| !network.bssid.is_zero() && net.bssid == network.bssid)
                    .cloned()
                    .unwrap_or_else(|| network.clone());
                drop(behavior);
                if let Some(sim) = lock(&self.adapters).get_mut(&adapter.0) {
                    sim.links.insert(bss_index, joined);
                }
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::GetBssInfo => {
                let network = lock(&self.adapters)
                    .get(&adapter.0)
                    .and_then(|sim| sim.links.get(&bss_index).cloned());
                Ok(IoctlResponse::BssInfo(BssInfo {
                    bss_mode: behavior.bss_mode,
                    media_connected: network.is_some(),
                    wep_enabled: behavior.wep_enabled,
                    is_deep_sleep: behavior.deep_sleep,
                    is_hs_configured: behavior.hs_configured,
                    network: network.unwrap_or_default(),
                }))
            }
            IoctlCommand::Disconnect => {
                drop(behavior);
                if let Some(sim) = lock(&self.adapters).get_mut(&adapter.0) {
                    sim.links.remove(&bss_index);
                }
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::SetDeepSleep { enable } => {
                behavior.deep_sleep = *enable;
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::CancelHostSleep => {
                behavior.hs_configured = false;
                Ok(IoctlResponse::Done)
            }
            IoctlCommand::RegisterWrite { .. }
            | IoctlCommand::HostCommand
            | IoctlCommand::InitShutdown
            | IoctlCommand::CancelScan
            | IoctlCommand::EnableWepKey
            | IoctlCommand::SetRate { .. } => Ok(IoctlResponse::Done),
        }
    }

    fn complete_later(
        delay: Duration,
        what: &str,
        complete: impl FnOnce() + Send + 'static,
    ) -> Result<(), WlanError> {
        thread::Builder::new()
            .name(format!("sim-{what}"))
            .spawn(move || {
                thread::sleep(delay);
                complete();
            })
            .map(|_| ())
            .map_err(|err| WlanError::subsystem(format!("spawn {what}: {err}")))
    }

    fn firmware_op(
        &self,
        adapter: AdapterRef,
        mode: SimCompletion,
        what: &'static str,
        complete: fn(&dyn HostCallbacks, Result<(), WlanError>),
    ) -> Result<OpStatus, WlanError> {
        let callbacks = self.callbacks(adapter)?;
        match mode {
            SimCompletion::Immediate => Ok(OpStatus::Success),
            SimCompletion::Fail => Err(WlanError::firmware(format!("{what} refused"))),
            SimCompletion::Never => Ok(OpStatus::Pending),
            SimCompletion::Deferred(delay) => {
                Self::complete_later(delay, what, move || complete(callbacks.as_ref(), Ok(())))?;
                Ok(OpStatus::Pending)
            }
        }
    }
}

impl AdapterSubsystem for SimSubsystem {
    fn register(
        &self,
        device: &DeviceDescriptor,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<AdapterRef, WlanError> {
        let (reject, timer_period) = {
            let behavior = lock(&self.behavior);
            (behavior.reject_register, behavior.timer_period)
        };
        if reject {
            return Err(WlanError::subsystem("register refused"));
        }
        let scratch = callbacks.malloc(SCRATCH_LEN)?;
        let host_lock = Arc::new(callbacks.new_lock());
        let ticks = Arc::clone(&self.timer_ticks);
        let timer = callbacks.new_timer(Box::new(move || {
            ticks.fetch_add(1, Ordering::SeqCst);
        }))?;
        if let Some(period) = timer_period {
            timer.start(period, true);
        }
        let id = self.next_ref.fetch_add(1, Ordering::SeqCst) + 1;
        lock(&self.adapters).insert(
            id,
            SimAdapter {
                device: device.clone(),
                callbacks,
                links: HashMap::new(),
                held_requests: Vec::new(),
                held_sends: Vec::new(),
                _scratch: scratch,
                host_lock,
                timer,
            },
        );
        self.registered.fetch_add(1, Ordering::SeqCst);
        debug!("sim: registered {} as {id} with {} bss", device.card, device.bss_attrs.len());
        Ok(AdapterRef(id))
    }

    fn download_firmware(
        &self,
        adapter: AdapterRef,
        image: &FirmwareImage,
    ) -> Result<(), WlanError> {
        self.callbacks(adapter)?;
        if lock(&self.behavior).reject_download {
            return Err(WlanError::firmware(format!("{} rejected", image.name())));
        }
        lock(&self.downloads).push(image.name().to_string());
        Ok(())
    }

    fn init_firmware(&self, adapter: AdapterRef) -> Result<OpStatus, WlanError> {
        let mode = lock(&self.behavior).init;
        self.firmware_op(adapter, mode, "init", |callbacks, result| {
            callbacks.init_fw_complete(result)
        })
    }

    fn shutdown_firmware(&self, adapter: AdapterRef) -> Result<OpStatus, WlanError> {
        let mode = lock(&self.behavior).shutdown;
        self.firmware_op(adapter, mode, "shutdown", |callbacks, result| {
            callbacks.shutdown_fw_complete(result)
        })
    }

    fn submit_request(
        &self,
        adapter: AdapterRef,
        request: RequestHandle,
    ) -> Result<RequestStatus, WlanError> {
        self.callbacks(adapter)?;
        let bss_index = request.request().bss_index();
        let command = request.request().command().clone();
        trace!("sim: bss {bss_index} {}", command.name());
        lock(&self.journal).push((bss_index, command.clone()));

        let mode = lock(&self.behavior).requests;
        match mode {
            SimRequests::Immediate => {
                self.respond(adapter, bss_index, &command).map(RequestStatus::Complete)
            }
            SimRequests::Hold => {
                if let Some(sim) = lock(&self.adapters).get_mut(&adapter.0) {
                    sim.held_requests.push(request);
                }
                Ok(RequestStatus::Pending)
            }
            SimRequests::Deferred(delay) => {
                let result = self.respond(adapter, bss_index, &command);
                Self::complete_later(delay, "ioctl", move || {
                    let _ = request.complete(result);
                })?;
                Ok(RequestStatus::Pending)
            }
        }
    }

    fn send_packet(&self, adapter: AdapterRef, buffer: DataBuffer) -> Result<OpStatus, WlanError> {
        let callbacks = self.callbacks(adapter)?;
        match lock(&self.behavior).send {
            SimSend::Immediate => {
                callbacks.free_buffer(buffer);
                Ok(OpStatus::Success)
            }
            SimSend::Hold => {
                if let Some(sim) = lock(&self.adapters).get_mut(&adapter.0) {
                    sim.held_sends.push(buffer);
                }
                Ok(OpStatus::Pending)
            }
        }
    }

    fn interrupt(&self, _adapter: AdapterRef) {
        self.interrupts.fetch_add(1, Ordering::SeqCst);
    }

    fn main_process(&self, adapter: AdapterRef) {
        let host_lock = lock(&self.adapters)
            .get(&adapter.0)
            .map(|sim| Arc::clone(&sim.host_lock));
        let _guard = host_lock.as_ref().map(|l| l.lock());
        self.main_passes.fetch_add(1, Ordering::SeqCst);
    }

    fn unregister(&self, adapter: AdapterRef) {
        let Some(sim) = lock(&self.adapters).remove(&adapter.0) else {
            return;
        };
        for handle in sim.held_requests {
            let _ = handle.complete(Err(WlanError::Removed));
        }
        for buffer in sim.held_sends {
            sim.callbacks.send_packet_complete(buffer, Err(WlanError::Removed));
        }
        if lock(&self.behavior).leak_timer {
            lock(&self.leaked_timers).push(sim.timer);
        } else {
            sim.timer.cancel();
        }
        self.unregistered.fetch_add(1, Ordering::SeqCst);
        debug!("sim: unregistered {}", adapter.0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Ssid;

    fn network(ssid: &str, last: u8) -> SsidBssid {
        SsidBssid::new(
            ssid.parse::<Ssid>().expect("ssid"),
            MacAddr([0x02, 0, 0, 0, 0, last]),
        )
    }

    #[test]
    fn find_best_network_prefers_bssid_then_ssid() {
        let sim = SimSubsystem::with_behavior(SimBehavior {
            scan_table: vec![network("home", 1), network("office", 2)],
            ..SimBehavior::default()
        });
        let by_bssid = SsidBssid::new(Ssid::empty(), MacAddr([0x02, 0, 0, 0, 0, 2]));
        let found = sim
            .respond(AdapterRef(1), 0, &IoctlCommand::FindBestNetwork(by_bssid))
            .and_then(IoctlResponse::into_network)
            .expect("found by bssid");
        assert_eq!(found, network("office", 2));

        let by_ssid = SsidBssid::new("home".parse().expect("ssid"), MacAddr::ZERO);
        let found = sim
            .respond(AdapterRef(1), 0, &IoctlCommand::FindBestNetwork(by_ssid))
            .and_then(IoctlResponse::into_network)
            .expect("found by ssid");
        assert_eq!(found.bssid, MacAddr([0x02, 0, 0, 0, 0, 1]));

        let missing = SsidBssid::new("cafe".parse().expect("ssid"), MacAddr::ZERO);
        assert!(matches!(
            sim.respond(AdapterRef(1), 0, &IoctlCommand::FindBestNetwork(missing)),
            Err(WlanError::NotFound { .. })
        ));
    }

    #[test]
    fn firmware_mac_differs_per_interface() {
        let sim = SimSubsystem::new();
        let mac = |bss| match sim.respond(AdapterRef(1), bss, &IoctlCommand::GetFwInfo) {
            Ok(IoctlResponse::FwInfo(info)) => info.mac,
            other => panic!("unexpected {other:?}"),
        };
        assert_ne!(mac(0), mac(1));
    }

    #[test]
    fn requests_for_unknown_adapters_are_rejected() {
        let sim = SimSubsystem::new();
        assert!(sim.init_firmware(AdapterRef(7)).is_err());
        assert!(sim.emit_event(AdapterRef(7), 0, AdapterEvent::LinkLost).is_err());
        assert_eq!(sim.complete_pending_sends(AdapterRef(7)), 0);
    }
}
