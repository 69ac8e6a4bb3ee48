//! Seams between the core and the adapter command subsystem.
//!
//! The subsystem owns the firmware protocol: it turns requests into firmware
//! commands and decodes events. The core registers each adapter with it and
//! receives completions through [`HostCallbacks`].

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::dispatch::{IoctlResponse, RequestHandle};
use crate::error::WlanError;
use crate::iface_table::InterfaceEntry;
use crate::pool::{DataBuffer, HostLock, HostTimer, PooledBytes, TimerCallback};
use crate::types::SsidBssid;

/// Identifies the physical card an adapter was discovered on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct CardId(pub u32);

impl fmt::Display for CardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "card{}", self.0)
    }
}

/// Opaque handle returned by [`AdapterSubsystem::register`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AdapterRef(pub u64);

/// Result of an operation that may complete later through a callback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpStatus {
    Success,
    Pending,
}

/// Result of [`AdapterSubsystem::submit_request`].
#[derive(Clone, Debug, PartialEq)]
pub enum RequestStatus {
    /// Finished synchronously; no completion callback follows.
    Complete(IoctlResponse),
    /// [`HostCallbacks::ioctl_complete`] will be invoked exactly once.
    Pending,
}

/// Software-init parameters passed at registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DeviceDescriptor {
    pub card: CardId,
    pub ps_mode: u32,
    pub auto_ds: u32,
    pub max_tx_buf: u32,
    pub fw_crc_check: bool,
    pub cfg_11d: u32,
    pub bss_attrs: Vec<InterfaceEntry>,
}

/// Firmware image bytes as fetched from a [`crate::firmware::FirmwareSource`].
#[derive(Clone, PartialEq, Eq)]
pub struct FirmwareImage {
    name: String,
    data: Arc<[u8]>,
}

impl FirmwareImage {
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl fmt::Debug for FirmwareImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FirmwareImage")
            .field("name", &self.name)
            .field("len", &self.data.len())
            .finish()
    }
}

/// Decoded adapter-originated event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdapterEvent {
    Connected(SsidBssid),
    LinkLost,
    AdhocLinkSensed,
    AdhocLinkLost,
    /// Opaque payload relayed to event listeners as is.
    Custom(Vec<u8>),
}

impl AdapterEvent {
    /// Payload relayed to event listeners.
    pub fn payload(&self) -> Vec<u8> {
        match self {
            AdapterEvent::Connected(net) => {
                format!("EVENT=CONNECTED bssid={}", net.bssid).into_bytes()
            }
            AdapterEvent::LinkLost => b"EVENT=LINK_LOST".to_vec(),
            AdapterEvent::AdhocLinkSensed => b"EVENT=ADHOC_LINK_SENSED".to_vec(),
            AdapterEvent::AdhocLinkLost => b"EVENT=ADHOC_LINK_LOST".to_vec(),
            AdapterEvent::Custom(bytes) => bytes.clone(),
        }
    }
}

/// Command-processing subsystem driving one or more adapters.
pub trait AdapterSubsystem: Send + Sync {
    fn register(
        &self,
        device: &DeviceDescriptor,
        callbacks: Arc<dyn HostCallbacks>,
    ) -> Result<AdapterRef, WlanError>;

    fn download_firmware(
        &self,
        adapter: AdapterRef,
        image: &FirmwareImage,
    ) -> Result<(), WlanError>;

    /// `Pending` means [`HostCallbacks::init_fw_complete`] follows.
    fn init_firmware(&self, adapter: AdapterRef) -> Result<OpStatus, WlanError>;

    /// `Pending` means [`HostCallbacks::shutdown_fw_complete`] follows.
    fn shutdown_firmware(&self, adapter: AdapterRef) -> Result<OpStatus, WlanError>;

    fn submit_request(
        &self,
        adapter: AdapterRef,
        request: RequestHandle,
    ) -> Result<RequestStatus, WlanError>;

    /// Queues a frame. On `Pending` the subsystem keeps the buffer and hands it
    /// back through [`HostCallbacks::send_packet_complete`].
    fn send_packet(&self, adapter: AdapterRef, buffer: DataBuffer) -> Result<OpStatus, WlanError>;

    /// Bus interrupt notification; runs in the caller's context.
    fn interrupt(&self, adapter: AdapterRef);

    /// Drains the command/event pipeline; runs on the adapter's worker.
    fn main_process(&self, adapter: AdapterRef);

    fn unregister(&self, adapter: AdapterRef);
}

/// Services the core provides to the subsystem for one adapter.
pub trait HostCallbacks: Send + Sync {
    fn init_fw_complete(&self, result: Result<(), WlanError>);

    fn shutdown_fw_complete(&self, result: Result<(), WlanError>);

    fn ioctl_complete(&self, request: &RequestHandle, result: Result<IoctlResponse, WlanError>);

    fn send_packet_complete(&self, buffer: DataBuffer, result: Result<(), WlanError>);

    fn recv_packet(&self, bss_index: u8, buffer: DataBuffer) -> Result<(), WlanError>;

    fn recv_event(&self, bss_index: u8, event: AdapterEvent);

    fn alloc_buffer(&self, size: usize) -> Result<DataBuffer, WlanError>;

    fn free_buffer(&self, buffer: DataBuffer);

    fn malloc(&self, size: usize) -> Result<PooledBytes, WlanError>;

    fn new_lock(&self) -> HostLock;

    /// Disarmed timer running `callback` on expiry. Counted until dropped.
    fn new_timer(&self, callback: TimerCallback) -> Result<HostTimer, WlanError>;
}

/// Receiver for frames the adapter delivers to the network stack.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, ifname: &str, frame: DataBuffer);
}

/// Sink that discards every frame.
#[derive(Debug, Default)]
pub struct DiscardSink;

impl PacketSink for DiscardSink {
    fn deliver(&self, _ifname: &str, frame: DataBuffer) {
        drop(frame);
    }
}
