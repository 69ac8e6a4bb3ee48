//! Per-adapter handle shared by the lifecycle controller, interfaces, the
//! deferred-work thread and the reassociation supervisor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::config::ModuleConfig;
use crate::dispatch::{
    Dispatcher, IoctlCommand, IoctlResponse, PendingCounters, Request, RequestCategory,
    RequestHandle, Submission, WaitMode,
};
use crate::error::{LeakReport, WlanError};
use crate::events::EventChannel;
use crate::iface_table::{DriverMode, InterfaceTable, MAX_BSS_NUM};
use crate::interface::Interface;
use crate::pool::{BufferPool, DataBuffer, HostLock, HostTimer, PooledBytes, TimerCallback};
use crate::reassoc::{self, ReassocControl, ReassocOutcome, ReassocSupervisor};
use crate::subsystem::{
    AdapterEvent, AdapterRef, AdapterSubsystem, CardId, HostCallbacks, OpStatus, PacketSink,
};
use crate::sync::{lock, Semaphore, Signal};
use crate::types::BssRole;
use crate::workqueue::WorkQueue;

/// Transmit queue is stopped at this many outstanding sends...
pub const MAX_TX_PENDING: i32 = 100;
/// ...and woken again once completions bring it below this.
pub const LOW_TX_PENDING: i32 = 80;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum HardwareStatus {
    Idle,
    Initializing,
    FirmwareReady,
    Ready,
    Removed,
    Failed,
}

impl HardwareStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, HardwareStatus::Removed | HardwareStatus::Failed)
    }

    /// Forward transitions only. Regressions happen through teardown.
    pub fn can_advance_to(self, next: HardwareStatus) -> bool {
        use HardwareStatus::*;
        match (self, next) {
            (current, Failed | Removed) => !current.is_terminal(),
            (Idle, Initializing) | (Initializing, FirmwareReady) | (FirmwareReady, Ready) => true,
            _ => false,
        }
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

pub struct Adapter {
    index: usize,
    card: CardId,
    label: String,
    config: ModuleConfig,
    subsystem: Arc<dyn AdapterSubsystem>,
    status: Mutex<HardwareStatus>,
    status_cv: Condvar,
    failure: Mutex<Option<WlanError>>,
    removed: Arc<AtomicBool>,
    pending: Arc<PendingCounters>,
    dispatcher: Dispatcher,
    pool: BufferPool,
    drv_mode: Mutex<DriverMode>,
    table: RwLock<Option<InterfaceTable>>,
    interfaces: RwLock<Vec<Option<Arc<Interface>>>>,
    fw_wait: Signal<Result<(), WlanError>>,
    reassoc: Arc<ReassocControl>,
    supervisor: Mutex<Option<ReassocSupervisor>>,
    workqueue: Mutex<Option<WorkQueue>>,
    events: Arc<EventChannel>,
    packet_sink: Arc<dyn PacketSink>,
    scan_pending_on_block: AtomicBool,
}

impl Adapter {
    pub(crate) fn new(
        index: usize,
        card: CardId,
        config: ModuleConfig,
        drv_mode: DriverMode,
        subsystem: Arc<dyn AdapterSubsystem>,
        events: Arc<EventChannel>,
        packet_sink: Arc<dyn PacketSink>,
    ) -> Arc<Self> {
        let label = format!("adapter({index})");
        let removed = Arc::new(AtomicBool::new(false));
        let pending = Arc::new(PendingCounters::default());
        let dispatcher = Dispatcher::new(
            label.clone(),
            Arc::clone(&subsystem),
            Arc::clone(&removed),
            Arc::clone(&pending),
            config.ioctl_timeout(),
        );
        let pool = BufferPool::new(config.max_request_payload);
        let reassoc = Arc::new(ReassocControl::new(config.reassoc));
        Arc::new(Self {
            index,
            card,
            label,
            subsystem,
            status: Mutex::new(HardwareStatus::Idle),
            status_cv: Condvar::new(),
            failure: Mutex::new(None),
            removed,
            pending,
            dispatcher,
            pool,
            drv_mode: Mutex::new(drv_mode),
            table: RwLock::new(None),
            interfaces: RwLock::new(vec![None; MAX_BSS_NUM]),
            fw_wait: Signal::new(),
            reassoc,
            supervisor: Mutex::new(None),
            workqueue: Mutex::new(None),
            events,
            packet_sink,
            scan_pending_on_block: AtomicBool::new(false),
            config,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn card(&self) -> CardId {
        self.card
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub(crate) fn subsystem(&self) -> &Arc<dyn AdapterSubsystem> {
        &self.subsystem
    }

    // --- hardware status -------------------------------------------------

    pub fn status(&self) -> HardwareStatus {
        *lock(&self.status)
    }

    pub(crate) fn advance(&self, next: HardwareStatus) -> Result<(), WlanError> {
        let mut status = lock(&self.status);
        if !status.can_advance_to(next) {
            return Err(WlanError::invalid_state(format!(
                "{}: {:?} -> {next:?} not allowed",
                self.label, *status
            )));
        }
        debug!("{}: {:?} -> {next:?}", self.label, *status);
        *status = next;
        drop(status);
        self.status_cv.notify_all();
        Ok(())
    }

    /// Teardown-only transition; may regress.
    pub(crate) fn force_status(&self, next: HardwareStatus) {
        let mut status = lock(&self.status);
        debug!("{}: {:?} => {next:?}", self.label, *status);
        *status = next;
        drop(status);
        self.status_cv.notify_all();
    }

    pub(crate) fn record_failure(&self, err: WlanError) {
        let mut failure = lock(&self.failure);
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    /// First error that drove the adapter to `Failed`, if any.
    pub fn failure(&self) -> Option<WlanError> {
        lock(&self.failure).clone()
    }

    /// Waits until the adapter is `Ready`, `Failed` or `Removed`, or until
    /// `timeout` elapses, and returns the status at that point.
    pub fn wait_settled(&self, timeout: Duration) -> HardwareStatus {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.status);
        loop {
            if matches!(*status, HardwareStatus::Ready) || status.is_terminal() {
                return *status;
            }
            let now = Instant::now();
            if now >= deadline {
                return *status;
            }
            status = match self.status_cv.wait_timeout(status, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    // --- removal ------------------------------------------------------------

    pub fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }

    /// Marks the adapter as gone. Every blocking wait observes the flag and
    /// returns `Removed`; later submissions fail immediately.
    pub fn surprise_remove(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            info!("{}: surprise removed", self.label);
        }
        self.reassoc.wake();
        self.status_cv.notify_all();
    }

    // --- dispatch -----------------------------------------------------------

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pending(&self) -> &Arc<PendingCounters> {
        &self.pending
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn adapter_ref(&self) -> Option<AdapterRef> {
        self.dispatcher.adapter_ref()
    }

    pub fn submit(&self, request: Request, mode: WaitMode) -> Result<Submission, WlanError> {
        self.dispatcher.submit(request, mode)
    }

    /// Allocates a parameterless request for `bss_index` and waits for it.
    pub(crate) fn request(
        &self,
        bss_index: u8,
        command: IoctlCommand,
    ) -> Result<IoctlResponse, WlanError> {
        let request = self.pool.allocate_request(bss_index, command, 0)?;
        self.dispatcher.submit_blocking(request)
    }

    pub(crate) fn fw_wait(&self) -> &Signal<Result<(), WlanError>> {
        &self.fw_wait
    }

    // --- interfaces -----------------------------------------------------------

    pub fn drv_mode(&self) -> DriverMode {
        *lock(&self.drv_mode)
    }

    pub(crate) fn set_drv_mode(&self, mode: DriverMode) {
        *lock(&self.drv_mode) = mode;
    }

    pub fn table(&self) -> Option<InterfaceTable> {
        read(&self.table).clone()
    }

    pub(crate) fn install_table(&self, table: InterfaceTable) {
        *write(&self.table) = Some(table);
    }

    pub(crate) fn clear_table(&self) {
        write(&self.table).take();
    }

    pub fn interfaces(&self) -> Vec<Arc<Interface>> {
        read(&self.interfaces).iter().flatten().cloned().collect()
    }

    pub fn interface(&self, slot: usize) -> Option<Arc<Interface>> {
        read(&self.interfaces).get(slot).cloned().flatten()
    }

    pub fn interface_by_name(&self, name: &str) -> Option<Arc<Interface>> {
        self.interfaces().into_iter().find(|iface| iface.name() == name)
    }

    /// Interface used for adapter-wide commands.
    pub fn first_interface(&self) -> Option<Arc<Interface>> {
        self.interfaces().into_iter().next()
    }

    pub fn interface_count(&self) -> usize {
        read(&self.interfaces).iter().flatten().count()
    }

    pub(crate) fn install_interface(&self, iface: Arc<Interface>) -> Result<(), WlanError> {
        let slot = usize::from(iface.bss_index());
        let mut slots = write(&self.interfaces);
        match slots.get_mut(slot) {
            Some(entry @ None) => {
                *entry = Some(iface);
                Ok(())
            }
            Some(Some(existing)) => Err(WlanError::invalid_state(format!(
                "{}: slot {slot} already holds {}",
                self.label,
                existing.name()
            ))),
            None => Err(WlanError::config(format!("{}: slot {slot} out of range", self.label))),
        }
    }

    /// Empties every slot and returns the removed interfaces in slot order.
    pub(crate) fn take_interfaces(&self) -> Vec<Arc<Interface>> {
        write(&self.interfaces).iter_mut().filter_map(Option::take).collect()
    }

    // --- deferred work --------------------------------------------------------

    pub(crate) fn start_workqueue(self: &Arc<Self>) -> Result<(), WlanError> {
        let queue = WorkQueue::start(&self.label, Arc::downgrade(self))
            .map_err(|err| WlanError::allocation(format!("{}: work queue: {err}", self.label)))?;
        *lock(&self.workqueue) = Some(queue);
        Ok(())
    }

    pub(crate) fn terminate_workqueue(&self) {
        let queue = lock(&self.workqueue).take();
        if let Some(queue) = queue {
            queue.terminate();
        }
    }

    pub(crate) fn queue_main_work(&self) {
        if self.is_removed() {
            return;
        }
        if let Some(queue) = lock(&self.workqueue).as_ref() {
            queue.queue_main_work();
        }
    }

    /// Main-process passes run so far.
    pub fn main_process_passes(&self) -> u64 {
        lock(&self.workqueue).as_ref().map(WorkQueue::passes).unwrap_or(0)
    }

    pub(crate) fn run_main_process(&self) {
        if let Some(adapter) = self.adapter_ref() {
            self.subsystem.main_process(adapter);
        }
        let limit = self.config.tx_watchdog();
        for iface in self.interfaces() {
            iface.check_tx_watchdog(limit);
        }
    }

    /// Bus interrupt entry point: notifies the subsystem and schedules a
    /// main-process pass. Ignored once the adapter is removed.
    pub fn interrupt(&self) {
        if self.is_removed() {
            return;
        }
        if let Some(adapter) = self.adapter_ref() {
            self.subsystem.interrupt(adapter);
            self.queue_main_work();
        }
    }

    // --- reassociation ----------------------------------------------------

    /// Lock serializing the supervisor against foreground scan/connect.
    pub fn reassoc_lock(&self) -> &Arc<Semaphore> {
        self.reassoc.lock()
    }

    pub fn reassoc_enabled(&self) -> bool {
        self.reassoc.is_enabled()
    }

    pub fn set_reassoc_enabled(&self, enabled: bool) {
        self.reassoc.set_enabled(enabled);
        if !enabled {
            self.reassoc.cancel_timer();
        }
    }

    pub fn wake_reassoc(&self) {
        self.reassoc.wake();
    }

    pub fn reassoc_timer_armed(&self) -> bool {
        self.reassoc.timer_armed()
    }

    /// Runs one reassociation pass on the calling thread and arms the retry
    /// timer when needed, as the supervisor does after a wake.
    pub fn run_reassoc_pass(&self) -> ReassocOutcome {
        let outcome = reassoc::run_pass(self);
        if outcome.rearm && !self.is_removed() {
            self.reassoc.arm_timer(self.config.reassoc_interval());
        }
        outcome
    }

    pub(crate) fn start_supervisor(self: &Arc<Self>) -> Result<(), WlanError> {
        let supervisor = ReassocSupervisor::spawn(
            &self.label,
            Arc::clone(&self.reassoc),
            Arc::downgrade(self),
            self.config.reassoc_interval(),
        )
        .map_err(|err| WlanError::allocation(format!("{}: reassoc thread: {err}", self.label)))?;
        *lock(&self.supervisor) = Some(supervisor);
        Ok(())
    }

    pub(crate) fn stop_supervisor(&self) {
        let supervisor = lock(&self.supervisor).take();
        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }
    }

    pub(crate) fn scan_pending_on_block(&self) -> &AtomicBool {
        &self.scan_pending_on_block
    }

    // --- data path -------------------------------------------------------------

    pub(crate) fn send_packet(&self, buffer: DataBuffer) -> Result<OpStatus, WlanError> {
        let adapter = self
            .adapter_ref()
            .ok_or_else(|| WlanError::invalid_state(format!("{}: not registered", self.label)))?;
        self.subsystem.send_packet(adapter, buffer)
    }

    fn on_send_complete(&self, buffer: DataBuffer, result: Result<(), WlanError>) {
        let left = self.pending.dec(RequestCategory::Tx);
        if let Some(iface) = self.interface(usize::from(buffer.bss_index)) {
            if let Err(err) = &result {
                trace!("{}: send on {} failed: {err}", self.label, iface.name());
                iface.record_tx_error();
            }
            if left < LOW_TX_PENDING {
                iface.wake_queue_if_stopped();
            }
        }
        self.pool.free_buffer(buffer);
    }

    fn deliver_rx(&self, bss_index: u8, buffer: DataBuffer) -> Result<(), WlanError> {
        if self.is_removed() {
            return Err(WlanError::Removed);
        }
        let iface = self
            .interface(usize::from(bss_index))
            .ok_or_else(|| WlanError::not_found(format!("{}: interface {bss_index}", self.label)))?;
        self.pending.inc(RequestCategory::Rx);
        iface.record_rx(buffer.len());
        self.packet_sink.deliver(iface.name(), buffer);
        self.pending.dec(RequestCategory::Rx);
        Ok(())
    }

    fn handle_event(&self, bss_index: u8, event: AdapterEvent) {
        let Some(iface) = self.interface(usize::from(bss_index)) else {
            warn!("{}: event {event:?} for empty slot {bss_index}", self.label);
            return;
        };
        match &event {
            AdapterEvent::Connected(network) => iface.on_connected(network.clone()),
            AdapterEvent::LinkLost => {
                iface.on_link_lost();
                if self.reassoc_enabled() && iface.role() == BssRole::Sta {
                    iface.set_reassoc_required(true);
                    self.wake_reassoc();
                }
            }
            AdapterEvent::AdhocLinkSensed => iface.set_adhoc_link(true),
            AdapterEvent::AdhocLinkLost => iface.set_adhoc_link(false),
            AdapterEvent::Custom(_) => {}
        }
        if let Err(err) = self.events.broadcast(iface.name(), &event.payload()) {
            debug!("{}: event for {} not relayed: {err}", self.label, iface.name());
        }
    }

    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    // --- auditing -----------------------------------------------------------

    /// Outstanding allocations and pending operations right now.
    pub fn leak_report(&self) -> LeakReport {
        LeakReport {
            tx_pending: self.pending.get(RequestCategory::Tx),
            rx_pending: self.pending.get(RequestCategory::Rx),
            ioctl_pending: self.pending.get(RequestCategory::Ioctl),
            ..self.pool.snapshot()
        }
    }

    pub(crate) fn log_leaks(&self, report: &LeakReport) {
        if report.is_clean() {
            return;
        }
        if report.malloc_count != 0 || report.lock_count != 0 || report.timer_count != 0 {
            error!(
                "{}: malloc_count={} lock_count={} timer_count={}",
                self.label, report.malloc_count, report.lock_count, report.timer_count
            );
        }
        if report.mbuf_alloc_count != 0 {
            error!("{}: mbuf_alloc_count={}", self.label, report.mbuf_alloc_count);
        }
        if report.request_count != 0 {
            error!("{}: request_count={}", self.label, report.request_count);
        }
        if report.tx_pending != 0 || report.rx_pending != 0 || report.ioctl_pending != 0 {
            error!(
                "{}: tx_pending={} rx_pending={} ioctl_pending={}",
                self.label, report.tx_pending, report.rx_pending, report.ioctl_pending
            );
        }
    }

    pub(crate) fn host_callbacks(self: &Arc<Self>) -> Arc<dyn HostCallbacks> {
        Arc::new(HostContext {
            adapter: Arc::downgrade(self),
            pool: self.pool.clone(),
        })
    }
}

impl std::fmt::Debug for Adapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Adapter")
            .field("index", &self.index)
            .field("card", &self.card)
            .field("status", &self.status())
            .field("removed", &self.is_removed())
            .field("interfaces", &self.interface_count())
            .finish()
    }
}

/// [`HostCallbacks`] for one adapter. Holds the adapter weakly so a
/// subsystem that keeps its callbacks past teardown does not keep the
/// adapter alive.
struct HostContext {
    adapter: Weak<Adapter>,
    pool: BufferPool,
}

impl HostCallbacks for HostContext {
    fn init_fw_complete(&self, result: Result<(), WlanError>) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        match &result {
            Ok(()) => {
                if let Err(err) = adapter.advance(HardwareStatus::Ready) {
                    warn!("{}: init complete: {err}", adapter.label);
                }
            }
            Err(err) => error!("{}: firmware init failed: {err}", adapter.label),
        }
        adapter.fw_wait.set(result);
    }

    fn shutdown_fw_complete(&self, result: Result<(), WlanError>) {
        let Some(adapter) = self.adapter.upgrade() else {
            return;
        };
        if let Err(err) = &result {
            warn!("{}: firmware shutdown reported {err}", adapter.label);
        }
        adapter.fw_wait.set(result);
    }

    fn ioctl_complete(&self, request: &RequestHandle, result: Result<IoctlResponse, WlanError>) {
        // Double completion is logged by the handle itself.
        let _ = request.complete(result);
    }

    fn send_packet_complete(&self, buffer: DataBuffer, result: Result<(), WlanError>) {
        match self.adapter.upgrade() {
            Some(adapter) => adapter.on_send_complete(buffer, result),
            None => self.pool.free_buffer(buffer),
        }
    }

    fn recv_packet(&self, bss_index: u8, buffer: DataBuffer) -> Result<(), WlanError> {
        let adapter = self.adapter.upgrade().ok_or(WlanError::Removed)?;
        adapter.deliver_rx(bss_index, buffer)
    }

    fn recv_event(&self, bss_index: u8, event: AdapterEvent) {
        if let Some(adapter) = self.adapter.upgrade() {
            adapter.handle_event(bss_index, event);
        }
    }

    fn alloc_buffer(&self, size: usize) -> Result<DataBuffer, WlanError> {
        self.pool.allocate_buffer(size)
    }

    fn free_buffer(&self, buffer: DataBuffer) {
        self.pool.free_buffer(buffer);
    }

    fn malloc(&self, size: usize) -> Result<PooledBytes, WlanError> {
        self.pool.malloc(size)
    }

    fn new_lock(&self) -> HostLock {
        self.pool.new_lock()
    }

    fn new_timer(&self, callback: TimerCallback) -> Result<HostTimer, WlanError> {
        self.pool.new_timer(callback)
    }
}

#[cfg(test)]
mod tests {
    use super::HardwareStatus::*;
    use super::*;

    #[test]
    fn status_only_advances_forward() {
        assert!(Idle.can_advance_to(Initializing));
        assert!(Initializing.can_advance_to(FirmwareReady));
        assert!(FirmwareReady.can_advance_to(Ready));
        assert!(!Ready.can_advance_to(FirmwareReady));
        assert!(!Idle.can_advance_to(Ready));
        assert!(!Initializing.can_advance_to(Ready));
    }

    #[test]
    fn terminal_states_are_sticky() {
        for state in [Idle, Initializing, FirmwareReady, Ready] {
            assert!(state.can_advance_to(Failed));
            assert!(state.can_advance_to(Removed));
        }
        assert!(!Failed.can_advance_to(Removed));
        assert!(!Removed.can_advance_to(Failed));
        assert!(!Removed.can_advance_to(Idle));
    }
}
