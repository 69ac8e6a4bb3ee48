//! Host-side control plane for a wireless adapter on a shared,
//! interrupt-driven bus.
//!
//! The crate brings adapters from discovery to a serviceable state, runs
//! several logical interfaces over one radio, dispatches firmware requests
//! and keeps station interfaces associated. It provides:
//!
//! - **[`LifecycleController`]** for attach, drv-mode switch and removal,
//!   serialized by the [`AdapterRegistry`] attach permit
//! - **[`Dispatcher`]** with blocking, polled and fire-and-forget waits that
//!   all observe surprise removal
//! - **[`InterfaceTable`]** construction from per-role interface counts
//! - a per-adapter reassociation supervisor
//! - **[`EventChannel`]** relaying adapter events to every attached listener
//! - **[`SimSubsystem`]**, a scriptable [`AdapterSubsystem`] for tests and
//!   dry runs
//!
//! The firmware protocol itself lives behind [`AdapterSubsystem`]; the core
//! only sees requests, completions, buffers and decoded events.

pub mod adapter;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod firmware;
pub mod iface_table;
pub mod initcfg;
pub mod interface;
pub mod lifecycle;
pub mod pool;
pub mod reassoc;
pub mod registry;
pub mod subsystem;
pub mod sync;
pub mod types;

mod workqueue;

mod sim;
pub use sim::{SimBehavior, SimCompletion, SimRequests, SimSend, SimSubsystem};

pub use adapter::{Adapter, HardwareStatus};
pub use config::ModuleConfig;
pub use dispatch::{Dispatcher, IoctlCommand, IoctlResponse, Request, Submission, WaitMode};
pub use error::{LeakReport, WlanError};
pub use events::{EventChannel, EventFrame};
pub use firmware::{DirFirmwareSource, FirmwareSource, MemoryFirmwareSource};
pub use iface_table::{DriverMode, InterfaceTable, RoleCounts, TableLimits};
pub use interface::{Interface, TxOutcome};
pub use lifecycle::LifecycleController;
pub use registry::AdapterRegistry;
pub use subsystem::{
    AdapterEvent, AdapterRef, AdapterSubsystem, CardId, HostCallbacks, PacketSink,
};
pub use types::{MacAddr, Ssid, SsidBssid};
