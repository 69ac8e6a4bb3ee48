//! Logical network interface hosted by an adapter slot.

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, info, warn};
use serde::Serialize;

use crate::adapter::{Adapter, MAX_TX_PENDING};
use crate::dispatch::{BssInfo, FwInfo, IoctlCommand, IoctlResponse, RequestCategory};
use crate::error::WlanError;
use crate::iface_table::InterfaceEntry;
use crate::subsystem::OpStatus;
use crate::sync::lock;
use crate::types::{BssRole, BssType, MacAddr, Ssid, SsidBssid, ETH_FRAME_LEN};

/// Link and queue state as seen by the network stack.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct LinkState {
    pub opened: bool,
    pub media_connected: bool,
    pub adhoc_link_sensed: bool,
    pub carrier_ok: bool,
    pub queue_stopped: bool,
    pub detached: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetStats {
    pub rx_packets: u64,
    pub tx_packets: u64,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub rx_errors: u64,
    pub tx_errors: u64,
    pub rx_dropped: u64,
    pub tx_dropped: u64,
    pub tx_timeouts: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// Consumed by the subsystem synchronously.
    Sent,
    /// Held by the subsystem until its send-complete callback.
    Queued,
    Dropped,
}

#[derive(Debug, Default)]
struct InterfaceState {
    mac: MacAddr,
    link: LinkState,
    stats: NetStats,
    reassoc_required: bool,
    last_network: Option<SsidBssid>,
    /// Fixed rate index; `None` is auto rate.
    rate_index: Option<u32>,
    /// When the queue was last stopped on tx backlog.
    backlog_since: Option<Instant>,
}

/// Priority from the IPv4 TOS precedence bits, 0 for anything else.
pub fn tx_priority(frame: &[u8]) -> u8 {
    const ETH_P_IP: [u8; 2] = [0x08, 0x00];
    match frame.get(12..16) {
        Some([t0, t1, _, tos]) if [*t0, *t1] == ETH_P_IP => (tos & 0xe0) >> 5,
        _ => 0,
    }
}

pub struct Interface {
    adapter: Weak<Adapter>,
    name: String,
    entry: InterfaceEntry,
    state: Mutex<InterfaceState>,
}

impl Interface {
    pub(crate) fn new(adapter: &Arc<Adapter>, name: String, entry: InterfaceEntry) -> Arc<Self> {
        Arc::new(Self {
            adapter: Arc::downgrade(adapter),
            name,
            entry,
            state: Mutex::new(InterfaceState {
                link: LinkState {
                    queue_stopped: true,
                    ..LinkState::default()
                },
                ..InterfaceState::default()
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bss_index(&self) -> u8 {
        self.entry.slot
    }

    pub fn bss_type(&self) -> BssType {
        self.entry.bss_type
    }

    pub fn role(&self) -> BssRole {
        self.entry.bss_type.role()
    }

    pub fn entry(&self) -> &InterfaceEntry {
        &self.entry
    }

    pub fn mac(&self) -> MacAddr {
        lock(&self.state).mac
    }

    pub fn link(&self) -> LinkState {
        lock(&self.state).link
    }

    pub fn stats(&self) -> NetStats {
        lock(&self.state).stats
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).link.media_connected
    }

    pub fn reassoc_required(&self) -> bool {
        lock(&self.state).reassoc_required
    }

    pub fn set_reassoc_required(&self, required: bool) {
        lock(&self.state).reassoc_required = required;
    }

    pub fn last_known_network(&self) -> Option<SsidBssid> {
        lock(&self.state).last_network.clone()
    }

    pub fn rate_index(&self) -> Option<u32> {
        lock(&self.state).rate_index
    }

    pub fn adapter(&self) -> Result<Arc<Adapter>, WlanError> {
        self.adapter.upgrade().ok_or(WlanError::Removed)
    }

    pub(crate) fn request(&self, command: IoctlCommand) -> Result<IoctlResponse, WlanError> {
        self.adapter()?.request(self.bss_index(), command)
    }

    /// Reads firmware information and adopts the permanent MAC address.
    pub(crate) fn init_priv(&self) -> Result<FwInfo, WlanError> {
        let info = self.request(IoctlCommand::GetFwInfo)?.into_fw_info()?;
        let mut state = lock(&self.state);
        if state.mac.is_zero() {
            state.mac = info.mac;
        }
        Ok(info)
    }

    pub fn open(&self) -> Result<(), WlanError> {
        let adapter = self.adapter()?;
        if adapter.is_removed() {
            return Err(WlanError::Removed);
        }
        let mut state = lock(&self.state);
        let link = &mut state.link;
        link.opened = true;
        link.carrier_ok = match self.role() {
            BssRole::Uap => link.media_connected,
            BssRole::Sta => link.media_connected || link.adhoc_link_sensed,
        };
        link.queue_stopped = false;
        link.detached = false;
        debug!("{}: open carrier={}", self.name, link.carrier_ok);
        Ok(())
    }

    pub fn close(&self) {
        let mut state = lock(&self.state);
        state.link.opened = false;
        state.link.queue_stopped = true;
        state.link.carrier_ok = false;
        debug!("{}: close", self.name);
    }

    /// Programs `mac` into the firmware; the previous address is restored
    /// when the firmware rejects it.
    pub fn set_mac_address(&self, mac: MacAddr) -> Result<(), WlanError> {
        let previous = {
            let mut state = lock(&self.state);
            std::mem::replace(&mut state.mac, mac)
        };
        match self.request(IoctlCommand::SetMacAddress(mac)) {
            Ok(_) => {
                info!("{}: mac address {mac}", self.name);
                Ok(())
            }
            Err(err) => {
                error!("{}: set mac address {mac} failed: {err}", self.name);
                lock(&self.state).mac = previous;
                Err(err)
            }
        }
    }

    /// Hands one Ethernet frame to the adapter. Frames are dropped, not
    /// failed, when their length is outside 1..=1514 or the subsystem
    /// rejects them.
    pub fn transmit(&self, frame: &[u8]) -> Result<TxOutcome, WlanError> {
        let adapter = match self.adapter() {
            Ok(adapter) if !adapter.is_removed() => adapter,
            _ => {
                lock(&self.state).stats.tx_dropped += 1;
                return Err(WlanError::Removed);
            }
        };
        if frame.is_empty() || frame.len() > ETH_FRAME_LEN {
            error!("{}: tx bad frame length {}", self.name, frame.len());
            lock(&self.state).stats.tx_dropped += 1;
            return Ok(TxOutcome::Dropped);
        }
        let mut buffer = match adapter.pool().buffer_from(frame) {
            Ok(buffer) => buffer,
            Err(err) => {
                lock(&self.state).stats.tx_dropped += 1;
                return Err(err);
            }
        };
        buffer.bss_index = self.bss_index();
        buffer.priority = tx_priority(frame);
        buffer.enqueued_at = SystemTime::now();

        let pending = Arc::clone(adapter.pending());
        if pending.inc(RequestCategory::Tx) >= MAX_TX_PENDING {
            debug!("{}: tx pending limit reached, stopping queue", self.name);
            self.stop_queue();
        }
        match adapter.send_packet(buffer) {
            Ok(OpStatus::Success) => {
                pending.dec(RequestCategory::Tx);
                self.record_tx(frame.len());
                Ok(TxOutcome::Sent)
            }
            Ok(OpStatus::Pending) => {
                self.record_tx(frame.len());
                adapter.queue_main_work();
                Ok(TxOutcome::Queued)
            }
            Err(err) => {
                pending.dec(RequestCategory::Tx);
                debug!("{}: tx dropped: {err}", self.name);
                lock(&self.state).stats.tx_dropped += 1;
                Ok(TxOutcome::Dropped)
            }
        }
    }

    /// Counts a transmit timeout and restarts the backlog clock.
    pub fn tx_timeout(&self) {
        let mut state = lock(&self.state);
        state.stats.tx_timeouts += 1;
        state.stats.tx_errors += 1;
        if state.backlog_since.is_some() {
            state.backlog_since = Some(Instant::now());
        }
        warn!("{}: tx timeout ({} so far)", self.name, state.stats.tx_timeouts);
    }

    /// Raises [`Interface::tx_timeout`] when the queue has been stopped on
    /// backlog for at least `limit`.
    pub(crate) fn check_tx_watchdog(&self, limit: Duration) -> bool {
        let expired = {
            let state = lock(&self.state);
            state.link.queue_stopped
                && !state.link.detached
                && state.backlog_since.is_some_and(|since| since.elapsed() >= limit)
        };
        if expired {
            self.tx_timeout();
        }
        expired
    }

    pub fn get_bss_info(&self) -> Result<BssInfo, WlanError> {
        self.request(IoctlCommand::GetBssInfo)?.into_bss_info()
    }

    /// Foreground scan. Serialized against the reassociation supervisor.
    pub fn scan(&self, ssid: Option<Ssid>) -> Result<(), WlanError> {
        let adapter = self.adapter()?;
        let _permit = adapter.reassoc_lock().acquire();
        adapter.scan_pending_on_block().store(true, Ordering::SeqCst);
        let result = self.request(IoctlCommand::Scan { ssid });
        adapter.scan_pending_on_block().store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    /// Foreground join. Serialized against the reassociation supervisor.
    pub fn connect(&self, network: SsidBssid) -> Result<(), WlanError> {
        if self.role() != BssRole::Sta {
            return Err(WlanError::invalid_state(format!(
                "{}: connect on access point",
                self.name
            )));
        }
        let adapter = self.adapter()?;
        let _permit = adapter.reassoc_lock().acquire();
        self.request(IoctlCommand::BssStart(network.clone()))?;
        self.on_connected(network);
        Ok(())
    }

    pub fn disconnect(&self) -> Result<(), WlanError> {
        self.request(IoctlCommand::Disconnect)?;
        let mut state = lock(&self.state);
        state.link.media_connected = false;
        state.link.carrier_ok = false;
        state.reassoc_required = false;
        Ok(())
    }

    /// Sets a fixed rate index, or auto rate with `None`.
    pub fn set_rate(&self, index: Option<u32>) -> Result<(), WlanError> {
        self.request(IoctlCommand::SetRate { index })?;
        lock(&self.state).rate_index = index;
        Ok(())
    }

    pub(crate) fn on_connected(&self, network: SsidBssid) {
        let mut state = lock(&self.state);
        info!("{}: connected to {} ({})", self.name, network.ssid, network.bssid);
        state.link.media_connected = true;
        if state.link.opened {
            state.link.carrier_ok = true;
            state.link.queue_stopped = false;
        }
        state.last_network = Some(network);
        state.reassoc_required = false;
    }

    /// Link-lost notification: carrier off and transmit stopped.
    pub(crate) fn on_link_lost(&self) {
        let mut state = lock(&self.state);
        if state.link.media_connected {
            info!("{}: link lost", self.name);
        }
        state.link.media_connected = false;
        state.link.carrier_ok = false;
        state.link.queue_stopped = true;
    }

    pub(crate) fn set_adhoc_link(&self, sensed: bool) {
        let mut state = lock(&self.state);
        state.link.adhoc_link_sensed = sensed;
        if state.link.opened && self.role() == BssRole::Sta {
            state.link.carrier_ok = sensed || state.link.media_connected;
        }
    }

    /// Stops the queue on tx backlog and starts the watchdog clock.
    pub(crate) fn stop_queue(&self) {
        let mut state = lock(&self.state);
        state.link.queue_stopped = true;
        state.backlog_since.get_or_insert_with(Instant::now);
    }

    pub(crate) fn wake_queue_if_stopped(&self) {
        let mut state = lock(&self.state);
        if state.link.opened && state.link.queue_stopped && !state.link.detached {
            state.link.queue_stopped = false;
        }
        state.backlog_since = None;
    }

    /// Quiesce for teardown or a drv-mode switch.
    pub(crate) fn detach(&self) {
        let mut state = lock(&self.state);
        state.link.queue_stopped = true;
        state.link.detached = true;
    }

    pub(crate) fn mark_disconnected(&self) {
        let mut state = lock(&self.state);
        state.link.media_connected = false;
        state.link.carrier_ok = false;
    }

    pub(crate) fn record_tx(&self, len: usize) {
        let mut state = lock(&self.state);
        state.stats.tx_packets += 1;
        state.stats.tx_bytes += len as u64;
    }

    pub(crate) fn record_tx_error(&self) {
        lock(&self.state).stats.tx_errors += 1;
    }

    pub(crate) fn record_rx(&self, len: usize) {
        let mut state = lock(&self.state);
        state.stats.rx_packets += 1;
        state.stats.rx_bytes += len as u64;
    }
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface")
            .field("name", &self.name)
            .field("slot", &self.entry.slot)
            .field("bss_type", &self.entry.bss_type)
            .field("mac", &self.mac())
            .finish()
    }
}
