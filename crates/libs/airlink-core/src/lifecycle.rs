//! Device lifecycle controller.
//!
//! Brings an adapter from discovery to `Ready` (software init, firmware
//! fetch/download/init, interface registration, post-init configuration),
//! switches its interface composition while live, and tears it down. Every
//! transition runs under the registry's attach permit; an asynchronous
//! firmware fetch carries the permit along until the attach finishes.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use log::{debug, error, info, warn};

use crate::adapter::{Adapter, HardwareStatus};
use crate::config::ModuleConfig;
use crate::dispatch::IoctlCommand;
use crate::error::{LeakReport, WlanError};
use crate::events::EventChannel;
use crate::firmware::FirmwareSource;
use crate::iface_table::{DriverMode, InterfaceEntry, InterfaceTable, TableLimits};
use crate::initcfg::{parse_cal_data, parse_init_cfg, InitDirective};
use crate::interface::Interface;
use crate::registry::AdapterRegistry;
use crate::subsystem::{
    AdapterSubsystem, CardId, DeviceDescriptor, DiscardSink, FirmwareImage, OpStatus, PacketSink,
};
use crate::sync::{lock, sleep_cancellable, SemaphorePermit, WaitOutcome};
use crate::types::BssRole;

#[derive(Clone)]
pub struct LifecycleController {
    config: ModuleConfig,
    limits: TableLimits,
    registry: Arc<AdapterRegistry>,
    subsystem: Arc<dyn AdapterSubsystem>,
    firmware: Arc<dyn FirmwareSource>,
    events: Arc<EventChannel>,
    packet_sink: Arc<dyn PacketSink>,
}

impl LifecycleController {
    pub fn new(
        config: ModuleConfig,
        subsystem: Arc<dyn AdapterSubsystem>,
        firmware: Arc<dyn FirmwareSource>,
    ) -> Result<Self, WlanError> {
        config.validate()?;
        Ok(Self {
            config,
            limits: TableLimits::default(),
            registry: Arc::new(AdapterRegistry::default()),
            subsystem,
            firmware,
            events: Arc::new(EventChannel::new()),
            packet_sink: Arc::new(DiscardSink),
        })
    }

    pub fn with_registry(mut self, registry: Arc<AdapterRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_limits(mut self, limits: TableLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_packet_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.packet_sink = sink;
        self
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    pub fn registry(&self) -> &Arc<AdapterRegistry> {
        &self.registry
    }

    pub fn adapter(&self, card: CardId) -> Option<Arc<Adapter>> {
        self.registry.find_by_card(card)
    }

    fn build_table(&self, mode: DriverMode) -> Result<InterfaceTable, WlanError> {
        InterfaceTable::build(
            mode,
            self.config.role_counts(),
            self.config.fw_name.as_deref(),
            &self.limits,
        )
    }

    /// Attaches `card`.
    ///
    /// With a blocking firmware fetch the adapter is `Ready` (or the error
    /// is returned) when this returns. With `req_fw_nowait` the fetch
    /// continues in the background; use [`Adapter::wait_settled`] to learn
    /// the outcome.
    pub fn add_card(&self, card: CardId) -> Result<Arc<Adapter>, WlanError> {
        let permit = self.registry.acquire_attach();
        let mode = self.config.driver_mode()?;
        let table = self.build_table(mode)?;
        let adapter = self.registry.install(card, |index| {
            Adapter::new(
                index,
                card,
                self.config.clone(),
                mode,
                Arc::clone(&self.subsystem),
                Arc::clone(&self.events),
                Arc::clone(&self.packet_sink),
            )
        })?;
        info!("{}: attaching {card}", adapter.label());

        if let Err(err) = self.init_sw(&adapter, table).and_then(|()| adapter.start_workqueue()) {
            self.fail(&adapter, err.clone());
            return Err(err);
        }
        self.init_fw(&adapter, permit)?;
        Ok(adapter)
    }

    /// `Idle -> Initializing`: installs the table and registers the adapter
    /// with the subsystem.
    fn init_sw(&self, adapter: &Arc<Adapter>, table: InterfaceTable) -> Result<(), WlanError> {
        adapter.advance(HardwareStatus::Initializing)?;
        let config = adapter.config();
        let device = DeviceDescriptor {
            card: adapter.card(),
            ps_mode: config.ps_mode,
            auto_ds: config.auto_ds,
            max_tx_buf: config.max_tx_buf,
            fw_crc_check: config.fw_crc_check,
            cfg_11d: config.cfg_11d,
            bss_attrs: table.entries.clone(),
        };
        debug!(
            "{}: {} interfaces, firmware {}",
            adapter.label(),
            table.len(),
            table.fw_name
        );
        adapter.install_table(table);
        let adapter_ref = self.subsystem.register(&device, adapter.host_callbacks())?;
        adapter.dispatcher().attach(adapter_ref);
        Ok(())
    }

    /// Fetches the image named by the installed table and finishes the
    /// attach. `permit` is released once the outcome is settled.
    fn init_fw(&self, adapter: &Arc<Adapter>, permit: SemaphorePermit) -> Result<(), WlanError> {
        let Some(fw_name) = adapter.table().map(|table| table.fw_name) else {
            let err = WlanError::invalid_state(format!("{}: no interface table", adapter.label()));
            self.fail(adapter, err.clone());
            return Err(err);
        };

        if !self.config.req_fw_nowait {
            let image = match self.firmware.fetch(&fw_name) {
                Ok(image) => image,
                Err(err) => {
                    error!("{}: request firmware {fw_name} failed: {err}", adapter.label());
                    let err = WlanError::firmware(format!("request {fw_name}: {err}"));
                    self.fail(adapter, err.clone());
                    return Err(err);
                }
            };
            let result = self.finish_attach(adapter, &image);
            drop(permit);
            return result;
        }

        let fetch = FirmwareFetch {
            controller: self.clone(),
            adapter: Arc::clone(adapter),
            fw_name,
            started: Instant::now(),
            attempts: 1,
            permit,
        };
        if let Err((fetch, err)) = fetch.request() {
            error!("{}: request firmware failed: {err}", adapter.label());
            fetch.give_up(err.clone());
            return Err(err);
        }
        Ok(())
    }

    /// Download, firmware init and interface bring-up. Rolls back on error.
    fn finish_attach(
        &self,
        adapter: &Arc<Adapter>,
        image: &FirmwareImage,
    ) -> Result<(), WlanError> {
        match self.bring_up(adapter, image) {
            Ok(()) => {
                info!(
                    "{}: ready, {} interfaces",
                    adapter.label(),
                    adapter.interface_count()
                );
                Ok(())
            }
            Err(err) => {
                error!("{}: attach failed: {err}", adapter.label());
                self.fail(adapter, err.clone());
                Err(err)
            }
        }
    }

    fn bring_up(&self, adapter: &Arc<Adapter>, image: &FirmwareImage) -> Result<(), WlanError> {
        self.download_and_init(adapter, image)?;
        self.add_interfaces(adapter)?;
        adapter.set_reassoc_enabled(adapter.config().reassoc);
        adapter.start_supervisor()
    }

    /// `Initializing -> FirmwareReady -> Ready`.
    fn download_and_init(&self, adapter: &Adapter, image: &FirmwareImage) -> Result<(), WlanError> {
        if adapter.is_removed() {
            return Err(WlanError::Removed);
        }
        let adapter_ref = adapter.adapter_ref().ok_or_else(|| {
            WlanError::invalid_state(format!("{}: not registered", adapter.label()))
        })?;
        info!(
            "{}: downloading {} ({} bytes)",
            adapter.label(),
            image.name(),
            image.len()
        );
        self.subsystem
            .download_firmware(adapter_ref, image)
            .map_err(|err| WlanError::firmware(format!("download {}: {err}", image.name())))?;
        adapter.advance(HardwareStatus::FirmwareReady)?;

        adapter.fw_wait().reset();
        let status = self
            .subsystem
            .init_firmware(adapter_ref)
            .map_err(|err| WlanError::firmware(format!("init: {err}")))?;
        match status {
            OpStatus::Success => adapter.advance(HardwareStatus::Ready),
            OpStatus::Pending => {
                let timeout = adapter.config().fw_init_timeout();
                let deadline = Instant::now() + timeout;
                match adapter.fw_wait().wait(Some(deadline), &|| adapter.is_removed()) {
                    WaitOutcome::Ready(Ok(())) => {}
                    WaitOutcome::Ready(Err(err)) => {
                        return Err(WlanError::firmware(format!("init rejected: {err}")))
                    }
                    WaitOutcome::Cancelled => return Err(WlanError::Removed),
                    WaitOutcome::TimedOut => {
                        return Err(WlanError::timeout(format!("firmware init after {timeout:?}")))
                    }
                }
                match adapter.status() {
                    HardwareStatus::Ready => Ok(()),
                    other => Err(WlanError::firmware(format!("init completed in {other:?}"))),
                }
            }
        }
    }

    /// One interface per table entry, then the optional post-init
    /// configuration.
    fn add_interfaces(&self, adapter: &Arc<Adapter>) -> Result<(), WlanError> {
        let table = adapter.table().ok_or_else(|| {
            WlanError::invalid_state(format!("{}: no interface table", adapter.label()))
        })?;
        for entry in &table.entries {
            self.add_interface(adapter, *entry)?;
        }

        let config = adapter.config();
        if let Some(mac) = config.mac_override()? {
            let station = adapter
                .interfaces()
                .into_iter()
                .find(|iface| iface.role() == BssRole::Sta);
            if let Some(iface) = station {
                iface.set_mac_address(mac)?;
            }
        }
        if let Some(name) = &config.init_cfg {
            self.apply_init_cfg(adapter, name)?;
        }
        if let Some(name) = &config.cal_data_cfg {
            self.download_cal_data(adapter, name)?;
        }
        Ok(())
    }

    fn add_interface(
        &self,
        adapter: &Arc<Adapter>,
        entry: InterfaceEntry,
    ) -> Result<(), WlanError> {
        if adapter.is_removed() {
            return Err(WlanError::Removed);
        }
        let name = self.registry.alloc_name(entry.bss_type.name_prefix());
        let iface = Interface::new(adapter, name.clone(), entry);
        if let Err(err) = adapter.install_interface(Arc::clone(&iface)) {
            self.registry.release_name(&name);
            return Err(err);
        }
        match iface.init_priv() {
            Ok(info) => debug!(
                "{}: {name} in slot {} fw {:#x} mac {}",
                adapter.label(),
                entry.slot,
                info.fw_version,
                iface.mac()
            ),
            Err(WlanError::Removed) => return Err(WlanError::Removed),
            Err(err) => warn!("{}: {name}: firmware info unavailable: {err}", adapter.label()),
        }
        info!("{}: registered {name}", adapter.label());
        Ok(())
    }

    fn apply_init_cfg(&self, adapter: &Adapter, name: &str) -> Result<(), WlanError> {
        let image = self.firmware.fetch(name)?;
        let text = std::str::from_utf8(image.data())
            .map_err(|err| WlanError::config(format!("init config {name}: {err}")))?;
        let directives = parse_init_cfg(text)?;
        debug!("{}: {} init directives from {name}", adapter.label(), directives.len());
        for directive in directives {
            match directive {
                InitDirective::MacAddr { ifname, mac } => {
                    let interfaces = adapter.interfaces();
                    for iface in interfaces.iter().filter(|iface| iface.name() == ifname) {
                        iface.set_mac_address(mac)?;
                    }
                }
                InitDirective::RegWrite {
                    reg_type,
                    offset,
                    value,
                } => {
                    let iface = first_interface(adapter)?;
                    iface.request(IoctlCommand::RegisterWrite {
                        reg_type,
                        offset,
                        value,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn download_cal_data(&self, adapter: &Adapter, name: &str) -> Result<(), WlanError> {
        let image = self.firmware.fetch(name)?;
        let data = parse_cal_data(image.data())?;
        if data.is_empty() {
            return Err(WlanError::config(format!("calibration data {name} is empty")));
        }
        let iface = first_interface(adapter)?;
        let mut request = adapter
            .pool()
            .allocate_request(iface.bss_index(), IoctlCommand::HostCommand, data.len())?;
        request.payload_mut().copy_from_slice(&data);
        adapter.dispatcher().submit_blocking(request)?;
        info!("{}: downloaded {} bytes of calibration data", adapter.label(), data.len());
        Ok(())
    }

    /// Rolls back a failed attach or mode switch and leaves the adapter
    /// `Failed` and out of the registry.
    fn fail(&self, adapter: &Arc<Adapter>, err: WlanError) {
        adapter.record_failure(err);
        self.teardown(adapter);
        adapter.force_status(HardwareStatus::Failed);
        self.registry.release(adapter.index());
    }

    /// Cancels in-flight work and releases everything the adapter holds
    /// except its registry slot.
    fn teardown(&self, adapter: &Adapter) -> LeakReport {
        let status = adapter.status();
        adapter.surprise_remove();
        for iface in adapter.interfaces() {
            iface.detach();
        }
        adapter.stop_supervisor();
        if matches!(status, HardwareStatus::FirmwareReady | HardwareStatus::Ready) {
            self.shutdown_firmware(adapter);
        }
        let pending = adapter.leak_report();
        debug!(
            "{}: pending tx={} rx={} ioctl={}",
            adapter.label(),
            pending.tx_pending,
            pending.rx_pending,
            pending.ioctl_pending
        );
        self.remove_interfaces(adapter);
        adapter.terminate_workqueue();
        if let Some(adapter_ref) = adapter.dispatcher().detach() {
            self.subsystem.unregister(adapter_ref);
        }
        adapter.clear_table();
        let report = adapter.leak_report();
        adapter.log_leaks(&report);
        report
    }

    fn remove_interfaces(&self, adapter: &Adapter) {
        for iface in adapter.take_interfaces() {
            iface.close();
            self.registry.release_name(iface.name());
            debug!("{}: unregistered {}", adapter.label(), iface.name());
        }
    }

    /// Bounded wait for the firmware to shut down. Not cancelled by removal.
    fn shutdown_firmware(&self, adapter: &Adapter) {
        let Some(adapter_ref) = adapter.adapter_ref() else {
            return;
        };
        adapter.fw_wait().reset();
        match self.subsystem.shutdown_firmware(adapter_ref) {
            Ok(OpStatus::Success) => debug!("{}: firmware shut down", adapter.label()),
            Ok(OpStatus::Pending) => {
                let timeout = adapter.config().shutdown_timeout();
                match adapter.fw_wait().wait(Some(Instant::now() + timeout), &|| false) {
                    WaitOutcome::Ready(Ok(())) => debug!("{}: firmware shut down", adapter.label()),
                    WaitOutcome::Ready(Err(err)) => {
                        warn!("{}: firmware shutdown failed: {err}", adapter.label())
                    }
                    WaitOutcome::TimedOut | WaitOutcome::Cancelled => {
                        warn!("{}: firmware shutdown timed out after {timeout:?}", adapter.label())
                    }
                }
            }
            Err(err) => warn!("{}: firmware shutdown failed: {err}", adapter.label()),
        }
    }

    /// Detaches `card` and returns what was still outstanding at teardown.
    pub fn remove_card(&self, card: CardId) -> Result<LeakReport, WlanError> {
        let adapter = self
            .registry
            .find_by_card(card)
            .ok_or_else(|| WlanError::not_found(card.to_string()))?;
        // Flag first so an attach still holding the permit aborts.
        adapter.surprise_remove();
        let _permit = self.registry.acquire_attach();
        // A concurrent attach may have failed and released the slot meanwhile.
        let still_installed = self
            .registry
            .get(adapter.index())
            .is_some_and(|current| Arc::ptr_eq(&current, &adapter));
        if !still_installed {
            return Err(WlanError::not_found(card.to_string()));
        }
        info!("{}: removing {card}", adapter.label());
        let report = self.teardown(&adapter);
        adapter.force_status(HardwareStatus::Removed);
        self.registry.release(adapter.index());
        Ok(report)
    }

    /// Replaces the interface composition of a live adapter. The new table
    /// is built first so an invalid mode leaves the adapter untouched.
    pub fn switch_drv_mode(&self, card: CardId, mode: DriverMode) -> Result<(), WlanError> {
        let permit = self.registry.acquire_attach();
        let adapter = self
            .registry
            .find_by_card(card)
            .ok_or_else(|| WlanError::not_found(card.to_string()))?;
        let table = self.build_table(mode)?;
        if adapter.status() != HardwareStatus::Ready {
            return Err(WlanError::invalid_state(format!(
                "{}: drv_mode switch while {:?}",
                adapter.label(),
                adapter.status()
            )));
        }
        if adapter.drv_mode() == mode {
            info!("{}: drv_mode {:#x} unchanged", adapter.label(), mode.bits());
            return Ok(());
        }
        info!(
            "{}: switching drv_mode {:#x} -> {:#x}",
            adapter.label(),
            adapter.drv_mode().bits(),
            mode.bits()
        );

        self.reset_interfaces(&adapter);
        if let Some(first) = adapter.first_interface() {
            if let Err(err) = first.request(IoctlCommand::InitShutdown) {
                warn!("{}: init shutdown: {err}", adapter.label());
            }
        }
        adapter.stop_supervisor();
        self.shutdown_firmware(&adapter);
        self.remove_interfaces(&adapter);
        if let Some(adapter_ref) = adapter.dispatcher().detach() {
            self.subsystem.unregister(adapter_ref);
        }
        adapter.clear_table();
        let report = adapter.leak_report();
        adapter.log_leaks(&report);

        adapter.force_status(HardwareStatus::Idle);
        adapter.set_drv_mode(mode);
        if let Err(err) = self.init_sw(&adapter, table) {
            self.fail(&adapter, err.clone());
            return Err(err);
        }
        self.init_fw(&adapter, permit)
    }

    /// Quiesces every interface ahead of a firmware shutdown.
    fn reset_interfaces(&self, adapter: &Adapter) {
        let interfaces = adapter.interfaces();
        for iface in &interfaces {
            iface.detach();
        }
        let Some(first) = interfaces.first() else {
            return;
        };
        let bss = match first.get_bss_info() {
            Ok(bss) => Some(bss),
            Err(err) => {
                warn!("{}: bss info unavailable: {err}", adapter.label());
                None
            }
        };
        if adapter.scan_pending_on_block().swap(false, Ordering::SeqCst) {
            if let Err(err) = first.request(IoctlCommand::CancelScan) {
                warn!("{}: cancel scan: {err}", adapter.label());
            }
        }
        if let Some(bss) = &bss {
            if first.role() == BssRole::Sta && bss.is_deep_sleep {
                if let Err(err) = first.request(IoctlCommand::SetDeepSleep { enable: false }) {
                    warn!("{}: exit deep sleep: {err}", adapter.label());
                }
            }
            if bss.is_hs_configured {
                if let Err(err) = first.request(IoctlCommand::CancelHostSleep) {
                    warn!("{}: cancel host sleep: {err}", adapter.label());
                }
            }
        }
        for iface in &interfaces {
            if iface.is_connected() || iface.role() == BssRole::Uap {
                if let Err(err) = iface.disconnect() {
                    warn!("{}: disconnect: {err}", iface.name());
                }
                iface.mark_disconnected();
            }
        }
        adapter.set_reassoc_enabled(false);
    }

    /// Disconnects and shuts down the firmware of every adapter, then
    /// removes them all.
    pub fn shutdown_all(&self) -> Vec<(CardId, LeakReport)> {
        {
            let _permit = self.registry.acquire_attach();
            for adapter in self.registry.adapters() {
                if adapter.status() != HardwareStatus::Ready {
                    continue;
                }
                for iface in adapter.interfaces() {
                    if iface.is_connected() || iface.role() == BssRole::Uap {
                        if let Err(err) = iface.disconnect() {
                            warn!("{}: disconnect: {err}", iface.name());
                        }
                    }
                }
                if let Some(first) = adapter.first_interface() {
                    if first.role() == BssRole::Sta {
                        if let Ok(bss) = first.get_bss_info() {
                            if bss.is_deep_sleep {
                                let wake = IoctlCommand::SetDeepSleep { enable: false };
                                if let Err(err) = first.request(wake) {
                                    warn!("{}: exit deep sleep: {err}", adapter.label());
                                }
                            }
                        }
                    }
                    if let Err(err) = first.request(IoctlCommand::InitShutdown) {
                        warn!("{}: init shutdown: {err}", adapter.label());
                    }
                }
            }
        }
        let mut reports = Vec::new();
        for adapter in self.registry.adapters() {
            match self.remove_card(adapter.card()) {
                Ok(report) => reports.push((adapter.card(), report)),
                Err(err) => warn!("{}: remove: {err}", adapter.label()),
            }
        }
        reports
    }
}

fn first_interface(adapter: &Adapter) -> Result<Arc<Interface>, WlanError> {
    adapter
        .first_interface()
        .ok_or_else(|| WlanError::invalid_state(format!("{}: no interfaces", adapter.label())))
}

impl std::fmt::Debug for LifecycleController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LifecycleController")
            .field("adapters", &self.registry.len())
            .field("req_fw_nowait", &self.config.req_fw_nowait)
            .finish()
    }
}

/// State of one asynchronous firmware request chain. Owns the attach permit
/// until the chain ends.
struct FirmwareFetch {
    controller: LifecycleController,
    adapter: Arc<Adapter>,
    fw_name: String,
    started: Instant,
    attempts: u32,
    permit: SemaphorePermit,
}

impl FirmwareFetch {
    /// Starts one callback-style fetch. When the source cannot start it the
    /// chain is handed back so the caller can roll back under the permit.
    fn request(self) -> Result<(), (FirmwareFetch, WlanError)> {
        let firmware = Arc::clone(&self.controller.firmware);
        let name = self.fw_name.clone();
        let slot = Arc::new(Mutex::new(Some(self)));
        let callback_slot = Arc::clone(&slot);
        let started = firmware.fetch_nowait(
            name,
            Box::new(move |image| {
                let fetch = lock(&callback_slot).take();
                if let Some(fetch) = fetch {
                    fetch.on_image(image);
                }
            }),
        );
        match started {
            Ok(()) => Ok(()),
            Err(err) => match lock(&slot).take() {
                Some(fetch) => Err((fetch, err)),
                None => Ok(()),
            },
        }
    }

    fn on_image(mut self, image: Option<FirmwareImage>) {
        let label = self.adapter.label().to_string();
        if let Some(image) = image {
            debug!("{label}: firmware {} after {} attempts", image.name(), self.attempts);
            let _ = self.controller.finish_attach(&self.adapter, &image);
            return;
        }
        if self.adapter.is_removed() {
            self.give_up(WlanError::Removed);
            return;
        }
        let timeout = self.adapter.config().fw_request_timeout();
        if self.started.elapsed() >= timeout {
            error!(
                "{label}: firmware {} unavailable after {} attempts in {timeout:?}",
                self.fw_name, self.attempts
            );
            let err = WlanError::firmware(format!(
                "{} not available within {timeout:?}",
                self.fw_name
            ));
            self.give_up(err);
            return;
        }
        let adapter = Arc::clone(&self.adapter);
        if !sleep_cancellable(adapter.config().fw_retry_interval(), &|| adapter.is_removed()) {
            self.give_up(WlanError::Removed);
            return;
        }
        self.attempts += 1;
        debug!("{label}: retrying firmware {} (attempt {})", self.fw_name, self.attempts);
        if let Err((fetch, err)) = self.request() {
            error!("{label}: request firmware failed: {err}");
            fetch.give_up(err);
        }
    }

    fn give_up(self, err: WlanError) {
        self.controller.fail(&self.adapter, err);
        drop(self.permit);
    }
}
