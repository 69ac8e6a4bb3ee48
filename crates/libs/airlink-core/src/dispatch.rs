//! Command dispatch and wait layer.
//!
//! A [`Request`] is submitted to the adapter subsystem and, depending on the
//! [`WaitMode`], the caller blocks until completion, keeps a handle to poll,
//! or walks away. Completion is signalled exactly once per request; blocking
//! waits observe the adapter's surprise-removed flag and return
//! [`WlanError::Removed`] instead of hanging.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, trace};
use serde::Serialize;

use crate::error::WlanError;
use crate::pool::PooledBytes;
use crate::subsystem::{AdapterRef, AdapterSubsystem, RequestStatus};
use crate::sync::{lock, Signal, WaitOutcome};
use crate::types::{BssMode, MacAddr, Ssid, SsidBssid};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitMode {
    Blocking,
    NonBlockingPoll,
    FireAndForget,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RequestCategory {
    Tx,
    Rx,
    Ioctl,
}

/// Outstanding work per category, mutated from worker, callback and
/// foreground paths alike.
#[derive(Debug, Default)]
pub struct PendingCounters {
    tx: AtomicI32,
    rx: AtomicI32,
    ioctl: AtomicI32,
}

impl PendingCounters {
    fn counter(&self, category: RequestCategory) -> &AtomicI32 {
        match category {
            RequestCategory::Tx => &self.tx,
            RequestCategory::Rx => &self.rx,
            RequestCategory::Ioctl => &self.ioctl,
        }
    }

    pub fn inc(&self, category: RequestCategory) -> i32 {
        self.counter(category).fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn dec(&self, category: RequestCategory) -> i32 {
        self.counter(category).fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn get(&self, category: RequestCategory) -> i32 {
        self.counter(category).load(Ordering::SeqCst)
    }
}

/// Register type accepted by [`IoctlCommand::RegisterWrite`].
pub const MAX_REG_TYPE: u8 = 4;

/// Action requested from the firmware.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IoctlCommand {
    GetFwInfo,
    SetMacAddress(MacAddr),
    RegisterWrite { reg_type: u8, offset: u32, value: u32 },
    /// Raw firmware command carried in the request payload.
    HostCommand,
    /// Prepares the firmware for shutdown.
    InitShutdown,
    /// Scan, directed at one network when `ssid` is set.
    Scan { ssid: Option<Ssid> },
    CancelScan,
    /// Looks the network up in the last scan results. A non-zero BSSID is
    /// matched first, otherwise the SSID.
    FindBestNetwork(SsidBssid),
    /// Joins (station) or starts (access point) a BSS.
    BssStart(SsidBssid),
    GetBssInfo,
    EnableWepKey,
    SetRate { index: Option<u32> },
    Disconnect,
    SetDeepSleep { enable: bool },
    CancelHostSleep,
}

impl IoctlCommand {
    pub fn name(&self) -> &'static str {
        match self {
            IoctlCommand::GetFwInfo => "get_fw_info",
            IoctlCommand::SetMacAddress(_) => "set_mac_address",
            IoctlCommand::RegisterWrite { .. } => "register_write",
            IoctlCommand::HostCommand => "host_command",
            IoctlCommand::InitShutdown => "init_shutdown",
            IoctlCommand::Scan { .. } => "scan",
            IoctlCommand::CancelScan => "cancel_scan",
            IoctlCommand::FindBestNetwork(_) => "find_best_network",
            IoctlCommand::BssStart(_) => "bss_start",
            IoctlCommand::GetBssInfo => "get_bss_info",
            IoctlCommand::EnableWepKey => "enable_wep_key",
            IoctlCommand::SetRate { .. } => "set_rate",
            IoctlCommand::Disconnect => "disconnect",
            IoctlCommand::SetDeepSleep { .. } => "set_deep_sleep",
            IoctlCommand::CancelHostSleep => "cancel_host_sleep",
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FwInfo {
    pub fw_version: u32,
    pub mac: MacAddr,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BssInfo {
    pub bss_mode: BssMode,
    pub media_connected: bool,
    pub wep_enabled: bool,
    pub is_deep_sleep: bool,
    pub is_hs_configured: bool,
    pub network: SsidBssid,
}

#[derive(Clone, Debug, PartialEq)]
pub enum IoctlResponse {
    Done,
    FwInfo(FwInfo),
    BssInfo(BssInfo),
    Network(SsidBssid),
}

impl IoctlResponse {
    pub fn into_fw_info(self) -> Result<FwInfo, WlanError> {
        match self {
            IoctlResponse::FwInfo(info) => Ok(info),
            other => Err(WlanError::subsystem(format!("expected fw info, got {other:?}"))),
        }
    }

    pub fn into_bss_info(self) -> Result<BssInfo, WlanError> {
        match self {
            IoctlResponse::BssInfo(info) => Ok(info),
            other => Err(WlanError::subsystem(format!("expected bss info, got {other:?}"))),
        }
    }

    pub fn into_network(self) -> Result<SsidBssid, WlanError> {
        match self {
            IoctlResponse::Network(net) => Ok(net),
            other => Err(WlanError::subsystem(format!("expected network, got {other:?}"))),
        }
    }
}

/// Unit of work for the adapter subsystem, addressed to one interface.
///
/// Allocated through [`crate::pool::BufferPool::allocate_request`] so the
/// parameter block is counted.
#[derive(Debug)]
pub struct Request {
    id: u64,
    bss_index: u8,
    command: IoctlCommand,
    category: RequestCategory,
    payload: PooledBytes,
}

impl Request {
    pub(crate) fn new(bss_index: u8, command: IoctlCommand, payload: PooledBytes) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            bss_index,
            command,
            category: RequestCategory::Ioctl,
            payload,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn bss_index(&self) -> u8 {
        self.bss_index
    }

    pub fn command(&self) -> &IoctlCommand {
        &self.command
    }

    pub fn category(&self) -> RequestCategory {
        self.category
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.payload
    }
}

struct RequestState {
    request: Request,
    mode: WaitMode,
    completed: AtomicBool,
    result: Signal<Result<IoctlResponse, WlanError>>,
    pending: Arc<PendingCounters>,
}

/// Shared view of a submitted request. The subsystem keeps a clone until it
/// reports completion; the request is freed when the last clone drops.
#[derive(Clone)]
pub struct RequestHandle {
    state: Arc<RequestState>,
}

impl RequestHandle {
    fn new(request: Request, mode: WaitMode, pending: Arc<PendingCounters>) -> Self {
        Self {
            state: Arc::new(RequestState {
                request,
                mode,
                completed: AtomicBool::new(false),
                result: Signal::new(),
                pending,
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.state.request.id
    }

    pub fn request(&self) -> &Request {
        &self.state.request
    }

    pub fn is_completed(&self) -> bool {
        self.state.completed.load(Ordering::SeqCst)
    }

    /// Records the outcome and wakes the waiter. A second completion is a
    /// subsystem bug: it is logged and rejected without touching counters.
    pub fn complete(&self, result: Result<IoctlResponse, WlanError>) -> Result<(), WlanError> {
        let request = &self.state.request;
        if self.state.completed.swap(true, Ordering::SeqCst) {
            error!(
                "dispatch: request {} ({}) completed twice",
                request.id,
                request.command.name()
            );
            return Err(WlanError::AlreadyCompleted { id: request.id });
        }
        let left = self.state.pending.dec(request.category);
        trace!(
            "dispatch: request {} ({}) complete ok={} pending={left}",
            request.id,
            request.command.name(),
            result.is_ok()
        );
        if self.state.mode != WaitMode::FireAndForget {
            self.state.result.set(result);
        } else if let Err(err) = result {
            debug!("dispatch: detached request {} failed: {err}", request.id);
        }
        Ok(())
    }

    fn wait(
        &self,
        timeout: Option<Duration>,
        removed: &AtomicBool,
    ) -> Result<IoctlResponse, WlanError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        match self
            .state
            .result
            .wait(deadline, &|| removed.load(Ordering::SeqCst))
        {
            WaitOutcome::Ready(result) => result,
            WaitOutcome::Cancelled => Err(WlanError::Removed),
            WaitOutcome::TimedOut => Err(WlanError::timeout(self.state.request.command.name())),
        }
    }
}

impl fmt::Debug for RequestHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestHandle")
            .field("id", &self.state.request.id)
            .field("command", &self.state.request.command)
            .field("mode", &self.state.mode)
            .field("completed", &self.is_completed())
            .finish()
    }
}

/// Handle kept by a [`WaitMode::NonBlockingPoll`] submitter.
#[derive(Debug)]
pub struct PendingRequest {
    handle: RequestHandle,
    removed: Arc<AtomicBool>,
}

impl PendingRequest {
    pub fn id(&self) -> u64 {
        self.handle.id()
    }

    /// Yields the result once it is available. Returns `Removed` when the
    /// adapter went away before completion.
    pub fn poll(&self) -> Option<Result<IoctlResponse, WlanError>> {
        if let Some(result) = self.handle.state.result.take() {
            return Some(result);
        }
        if self.removed.load(Ordering::SeqCst) {
            return Some(Err(WlanError::Removed));
        }
        None
    }

    pub fn wait(self, timeout: Option<Duration>) -> Result<IoctlResponse, WlanError> {
        self.handle.wait(timeout, &self.removed)
    }
}

#[derive(Debug)]
pub enum Submission {
    Complete(IoctlResponse),
    Pending(PendingRequest),
    Detached,
}

/// Per-adapter front end to [`AdapterSubsystem::submit_request`].
pub struct Dispatcher {
    label: String,
    subsystem: Arc<dyn AdapterSubsystem>,
    adapter_ref: Mutex<Option<AdapterRef>>,
    removed: Arc<AtomicBool>,
    pending: Arc<PendingCounters>,
    timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        label: impl Into<String>,
        subsystem: Arc<dyn AdapterSubsystem>,
        removed: Arc<AtomicBool>,
        pending: Arc<PendingCounters>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            label: label.into(),
            subsystem,
            adapter_ref: Mutex::new(None),
            removed,
            pending,
            timeout,
        }
    }

    pub fn attach(&self, adapter: AdapterRef) {
        *lock(&self.adapter_ref) = Some(adapter);
    }

    pub fn detach(&self) -> Option<AdapterRef> {
        lock(&self.adapter_ref).take()
    }

    pub fn adapter_ref(&self) -> Option<AdapterRef> {
        *lock(&self.adapter_ref)
    }

    pub fn pending(&self) -> &Arc<PendingCounters> {
        &self.pending
    }

    pub fn submit(&self, request: Request, mode: WaitMode) -> Result<Submission, WlanError> {
        if self.removed.load(Ordering::SeqCst) {
            return Err(WlanError::Removed);
        }
        let adapter = self
            .adapter_ref()
            .ok_or_else(|| WlanError::invalid_state(format!("{}: not registered", self.label)))?;

        let category = request.category();
        let handle = RequestHandle::new(request, mode, Arc::clone(&self.pending));
        let request = handle.request();
        trace!(
            "{}: submit request {} ({}) bss={} mode={mode:?}",
            self.label,
            request.id(),
            request.command().name(),
            request.bss_index()
        );
        self.pending.inc(category);

        match self.subsystem.submit_request(adapter, handle.clone()) {
            Err(err) => {
                // The subsystem never saw the request; no completion follows.
                if !handle.state.completed.swap(true, Ordering::SeqCst) {
                    self.pending.dec(category);
                }
                debug!("{}: request {} rejected: {err}", self.label, handle.id());
                Err(err)
            }
            Ok(RequestStatus::Complete(response)) => {
                if !handle.state.completed.swap(true, Ordering::SeqCst) {
                    self.pending.dec(category);
                }
                Ok(Submission::Complete(response))
            }
            Ok(RequestStatus::Pending) => match mode {
                WaitMode::Blocking => handle
                    .wait(self.timeout, &self.removed)
                    .map(Submission::Complete),
                WaitMode::NonBlockingPoll => Ok(Submission::Pending(PendingRequest {
                    handle,
                    removed: Arc::clone(&self.removed),
                })),
                WaitMode::FireAndForget => Ok(Submission::Detached),
            },
        }
    }

    /// Submits in [`WaitMode::Blocking`] and returns the response.
    pub fn submit_blocking(&self, request: Request) -> Result<IoctlResponse, WlanError> {
        match self.submit(request, WaitMode::Blocking)? {
            Submission::Complete(response) => Ok(response),
            other => Err(WlanError::invalid_state(format!(
                "{}: blocking submit returned {other:?}",
                self.label
            ))),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("label", &self.label)
            .field("adapter_ref", &self.adapter_ref())
            .field("pending", &self.pending)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;
    use crate::pool::DataBuffer;
    use crate::subsystem::{DeviceDescriptor, FirmwareImage, HostCallbacks, OpStatus};
    use std::thread;

    /// Holds every request and completes it only when told.
    #[derive(Default)]
    struct HoldingSubsystem {
        held: Mutex<Vec<RequestHandle>>,
        reject: AtomicBool,
        immediate: AtomicBool,
    }

    impl AdapterSubsystem for HoldingSubsystem {
        fn register(
            &self,
            _: &DeviceDescriptor,
            _: Arc<dyn HostCallbacks>,
        ) -> Result<AdapterRef, WlanError> {
            Ok(AdapterRef(1))
        }
        fn download_firmware(&self, _: AdapterRef, _: &FirmwareImage) -> Result<(), WlanError> {
            Ok(())
        }
        fn init_firmware(&self, _: AdapterRef) -> Result<OpStatus, WlanError> {
            Ok(OpStatus::Success)
        }
        fn shutdown_firmware(&self, _: AdapterRef) -> Result<OpStatus, WlanError> {
            Ok(OpStatus::Success)
        }
        fn submit_request(
            &self,
            _: AdapterRef,
            request: RequestHandle,
        ) -> Result<RequestStatus, WlanError> {
            if self.reject.load(Ordering::SeqCst) {
                return Err(WlanError::subsystem("rejected"));
            }
            if self.immediate.load(Ordering::SeqCst) {
                return Ok(RequestStatus::Complete(IoctlResponse::Done));
            }
            lock(&self.held).push(request);
            Ok(RequestStatus::Pending)
        }
        fn send_packet(&self, _: AdapterRef, _: DataBuffer) -> Result<OpStatus, WlanError> {
            Ok(OpStatus::Success)
        }
        fn interrupt(&self, _: AdapterRef) {}
        fn main_process(&self, _: AdapterRef) {}
        fn unregister(&self, _: AdapterRef) {}
    }

    struct Fixture {
        subsystem: Arc<HoldingSubsystem>,
        dispatcher: Arc<Dispatcher>,
        removed: Arc<AtomicBool>,
        pool: BufferPool,
    }

    fn fixture(timeout: Option<Duration>) -> Fixture {
        let subsystem = Arc::new(HoldingSubsystem::default());
        let removed = Arc::new(AtomicBool::new(false));
        let dispatcher = Dispatcher::new(
            "adapter(0)",
            subsystem.clone(),
            Arc::clone(&removed),
            Arc::new(PendingCounters::default()),
            timeout,
        );
        dispatcher.attach(AdapterRef(1));
        Fixture {
            subsystem,
            dispatcher: Arc::new(dispatcher),
            removed,
            pool: BufferPool::new(4096),
        }
    }

    fn request(pool: &BufferPool, command: IoctlCommand) -> Request {
        pool.allocate_request(0, command, 0).expect("request")
    }

    fn complete_held(subsystem: &HoldingSubsystem, result: Result<IoctlResponse, WlanError>) {
        for handle in lock(&subsystem.held).drain(..) {
            handle.complete(result.clone()).expect("first completion");
        }
    }

    #[test]
    fn blocking_submit_returns_completion() {
        let fx = fixture(None);
        let subsystem = fx.subsystem.clone();
        let completer = thread::spawn(move || {
            let started = Instant::now();
            while lock(&subsystem.held).is_empty() && started.elapsed() < Duration::from_secs(2) {
                thread::sleep(Duration::from_millis(5));
            }
            complete_held(&subsystem, Ok(IoctlResponse::Done));
        });
        let response = fx
            .dispatcher
            .submit_blocking(request(&fx.pool, IoctlCommand::GetBssInfo))
            .expect("response");
        assert_eq!(response, IoctlResponse::Done);
        completer.join().expect("join");
        assert_eq!(fx.dispatcher.pending().get(RequestCategory::Ioctl), 0);
    }

    #[test]
    fn blocking_submit_observes_removal() {
        let fx = fixture(None);
        let removed = Arc::clone(&fx.removed);
        let dispatcher = Arc::clone(&fx.dispatcher);
        let pool = fx.pool.clone();
        let scan = request(&pool, IoctlCommand::Scan { ssid: None });
        let caller = thread::spawn(move || dispatcher.submit_blocking(scan));
        thread::sleep(Duration::from_millis(50));
        let flagged_at = Instant::now();
        removed.store(true, Ordering::SeqCst);
        let result = caller.join().expect("join");
        assert_eq!(result, Err(WlanError::Removed));
        assert!(flagged_at.elapsed() < Duration::from_secs(1));
        // Still owned by the subsystem, so still counted.
        assert_eq!(fx.dispatcher.pending().get(RequestCategory::Ioctl), 1);
    }

    #[test]
    fn submit_after_removal_fails_fast() {
        let fx = fixture(None);
        fx.removed.store(true, Ordering::SeqCst);
        let err = fx
            .dispatcher
            .submit(request(&fx.pool, IoctlCommand::GetFwInfo), WaitMode::Blocking)
            .expect_err("removed");
        assert_eq!(err, WlanError::Removed);
        assert!(lock(&fx.subsystem.held).is_empty());
    }

    #[test]
    fn blocking_submit_times_out() {
        let fx = fixture(Some(Duration::from_millis(40)));
        let err = fx
            .dispatcher
            .submit_blocking(request(&fx.pool, IoctlCommand::GetFwInfo))
            .expect_err("timeout");
        assert!(matches!(err, WlanError::Timeout { .. }));
    }

    #[test]
    fn second_completion_is_rejected() {
        let fx = fixture(None);
        let submission = fx
            .dispatcher
            .submit(request(&fx.pool, IoctlCommand::GetFwInfo), WaitMode::NonBlockingPoll)
            .expect("submitted");
        let Submission::Pending(pending) = submission else {
            panic!("expected pending submission");
        };
        assert!(pending.poll().is_none());
        let handle = lock(&fx.subsystem.held).pop().expect("held");
        handle.complete(Ok(IoctlResponse::Done)).expect("first");
        let err = handle.complete(Ok(IoctlResponse::Done)).expect_err("second");
        assert_eq!(err, WlanError::AlreadyCompleted { id: handle.id() });
        assert_eq!(fx.dispatcher.pending().get(RequestCategory::Ioctl), 0);
        assert_eq!(pending.poll(), Some(Ok(IoctlResponse::Done)));
    }

    #[test]
    fn fire_and_forget_frees_request_after_completion() {
        let fx = fixture(None);
        let submission = fx
            .dispatcher
            .submit(request(&fx.pool, IoctlCommand::Disconnect), WaitMode::FireAndForget)
            .expect("submitted");
        assert!(matches!(submission, Submission::Detached));
        assert_eq!(fx.pool.counters().request_count(), 1);
        complete_held(&fx.subsystem, Ok(IoctlResponse::Done));
        assert_eq!(fx.pool.counters().request_count(), 0);
        assert_eq!(fx.dispatcher.pending().get(RequestCategory::Ioctl), 0);
    }

    #[test]
    fn rejected_and_immediate_requests_leave_no_pending_count() {
        let fx = fixture(None);
        fx.subsystem.reject.store(true, Ordering::SeqCst);
        assert!(fx
            .dispatcher
            .submit_blocking(request(&fx.pool, IoctlCommand::GetFwInfo))
            .is_err());
        fx.subsystem.reject.store(false, Ordering::SeqCst);
        fx.subsystem.immediate.store(true, Ordering::SeqCst);
        let submission = fx
            .dispatcher
            .submit(request(&fx.pool, IoctlCommand::GetFwInfo), WaitMode::NonBlockingPoll)
            .expect("submitted");
        assert!(matches!(submission, Submission::Complete(IoctlResponse::Done)));
        assert_eq!(fx.dispatcher.pending().get(RequestCategory::Ioctl), 0);
        assert_eq!(fx.pool.counters().request_count(), 0);
    }
}
