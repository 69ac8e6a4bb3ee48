//! Counted allocations for data buffers, request payloads and host-side
//! memory, lock and timer objects handed to the adapter subsystem.
//!
//! Every allocation carries a guard that decrements its counter when the
//! allocation is dropped, so the counters always equal the number of live
//! objects. They are read at teardown for leak auditing only.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime};

use log::warn;

use crate::dispatch::{IoctlCommand, Request};
use crate::error::{LeakReport, WlanError};
use crate::sync::lock;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CounterKind {
    Malloc,
    Lock,
    Timer,
    Mbuf,
    Request,
}

#[derive(Debug, Default)]
pub struct PoolCounters {
    malloc: AtomicI64,
    lock: AtomicI64,
    timer: AtomicI64,
    mbuf: AtomicI64,
    request: AtomicI64,
}

impl PoolCounters {
    fn counter(&self, kind: CounterKind) -> &AtomicI64 {
        match kind {
            CounterKind::Malloc => &self.malloc,
            CounterKind::Lock => &self.lock,
            CounterKind::Timer => &self.timer,
            CounterKind::Mbuf => &self.mbuf,
            CounterKind::Request => &self.request,
        }
    }

    pub fn malloc_count(&self) -> i64 {
        self.malloc.load(Ordering::SeqCst)
    }

    pub fn lock_count(&self) -> i64 {
        self.lock.load(Ordering::SeqCst)
    }

    pub fn timer_count(&self) -> i64 {
        self.timer.load(Ordering::SeqCst)
    }

    pub fn mbuf_alloc_count(&self) -> i64 {
        self.mbuf.load(Ordering::SeqCst)
    }

    pub fn request_count(&self) -> i64 {
        self.request.load(Ordering::SeqCst)
    }

    /// Pool half of a [`LeakReport`]; pending counters are left at zero.
    pub fn snapshot(&self) -> LeakReport {
        LeakReport {
            malloc_count: self.malloc_count(),
            lock_count: self.lock_count(),
            timer_count: self.timer_count(),
            mbuf_alloc_count: self.mbuf_alloc_count(),
            request_count: self.request_count(),
            ..LeakReport::default()
        }
    }
}

#[derive(Debug)]
struct CounterGuard {
    counters: Arc<PoolCounters>,
    kind: CounterKind,
}

impl CounterGuard {
    fn new(counters: &Arc<PoolCounters>, kind: CounterKind) -> Self {
        counters.counter(kind).fetch_add(1, Ordering::SeqCst);
        Self {
            counters: Arc::clone(counters),
            kind,
        }
    }
}

impl Drop for CounterGuard {
    fn drop(&mut self) {
        self.counters.counter(self.kind).fetch_sub(1, Ordering::SeqCst);
    }
}

/// Zero-initialised byte block owned by one counter.
#[derive(Debug)]
pub struct PooledBytes {
    bytes: Vec<u8>,
    _guard: CounterGuard,
}

impl PooledBytes {
    pub fn into_vec(self) -> Vec<u8> {
        let Self { bytes, _guard } = self;
        bytes
    }
}

impl Deref for PooledBytes {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.bytes
    }
}

impl DerefMut for PooledBytes {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.bytes
    }
}

/// Packet payload plus the metadata the transmit and receive paths attach.
#[derive(Debug)]
pub struct DataBuffer {
    data: PooledBytes,
    pub priority: u8,
    pub bss_index: u8,
    pub enqueued_at: SystemTime,
}

impl DataBuffer {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Host lock created on behalf of the adapter subsystem.
#[derive(Debug)]
pub struct HostLock {
    inner: Mutex<()>,
    _guard: CounterGuard,
}

impl HostLock {
    pub fn lock(&self) -> MutexGuard<'_, ()> {
        lock(&self.inner)
    }
}

/// Runs on the timer's own thread each time it expires.
pub type TimerCallback = Box<dyn Fn() + Send + Sync + 'static>;

#[derive(Debug, Default)]
struct TimerState {
    deadline: Option<Instant>,
    /// Re-arm interval for periodic timers.
    period: Option<Duration>,
    stop: bool,
}

#[derive(Debug, Default)]
struct TimerShared {
    state: Mutex<TimerState>,
    cv: Condvar,
    fired: AtomicU64,
}

impl TimerShared {
    /// Parks until the deadline passes, returning `false` on stop.
    fn wait_expiry(&self) -> bool {
        let mut state = lock(&self.state);
        loop {
            if state.stop {
                return false;
            }
            let now = Instant::now();
            match state.deadline {
                Some(deadline) if deadline <= now => {
                    state.deadline = state.period.map(|period| now + period);
                    return true;
                }
                Some(deadline) => {
                    state = match self.cv.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    };
                }
                None => {
                    state = match self.cv.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }
}

/// One-shot or periodic timer created on behalf of the adapter subsystem.
/// Created disarmed; dropping it stops and joins its thread.
pub struct HostTimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
    _guard: CounterGuard,
}

impl HostTimer {
    /// Arms the timer to fire after `period`, and every `period` after that
    /// when `periodic`. Re-arming replaces the previous schedule.
    pub fn start(&self, period: Duration, periodic: bool) {
        let mut state = lock(&self.shared.state);
        state.deadline = Some(Instant::now() + period);
        state.period = periodic.then_some(period);
        drop(state);
        self.shared.cv.notify_all();
    }

    /// Disarms the timer. An expiry that has not started yet never runs.
    pub fn cancel(&self) {
        let mut state = lock(&self.shared.state);
        state.deadline = None;
        state.period = None;
    }

    pub fn is_armed(&self) -> bool {
        lock(&self.shared.state).deadline.is_some()
    }

    /// Expiries delivered so far.
    pub fn fired(&self) -> u64 {
        self.shared.fired.load(Ordering::SeqCst)
    }
}

impl Drop for HostTimer {
    fn drop(&mut self) {
        lock(&self.shared.state).stop = true;
        self.shared.cv.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("host timer: callback panicked");
            }
        }
    }
}

impl std::fmt::Debug for HostTimer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostTimer")
            .field("armed", &self.is_armed())
            .field("fired", &self.fired())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BufferPool {
    counters: Arc<PoolCounters>,
    max_size: usize,
}

impl BufferPool {
    pub fn new(max_size: usize) -> Self {
        Self {
            counters: Arc::new(PoolCounters::default()),
            max_size,
        }
    }

    pub fn counters(&self) -> &Arc<PoolCounters> {
        &self.counters
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    fn alloc_bytes(
        &self,
        size: usize,
        kind: CounterKind,
        what: &str,
    ) -> Result<PooledBytes, WlanError> {
        if size > self.max_size {
            return Err(WlanError::allocation(format!(
                "{what} of {size} bytes exceeds {} byte cap",
                self.max_size
            )));
        }
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(size)
            .map_err(|err| WlanError::allocation(format!("{what} of {size} bytes: {err}")))?;
        bytes.resize(size, 0);
        Ok(PooledBytes {
            bytes,
            _guard: CounterGuard::new(&self.counters, kind),
        })
    }

    pub fn allocate_buffer(&self, size: usize) -> Result<DataBuffer, WlanError> {
        let data = self.alloc_bytes(size, CounterKind::Mbuf, "data buffer")?;
        Ok(DataBuffer {
            data,
            priority: 0,
            bss_index: 0,
            enqueued_at: SystemTime::now(),
        })
    }

    /// Allocates a buffer holding a copy of `payload`.
    pub fn buffer_from(&self, payload: &[u8]) -> Result<DataBuffer, WlanError> {
        let mut buffer = self.allocate_buffer(payload.len())?;
        buffer.data_mut().copy_from_slice(payload);
        Ok(buffer)
    }

    pub fn free_buffer(&self, buffer: DataBuffer) {
        drop(buffer);
    }

    /// Allocates a request addressed to interface `bss_index` with a zeroed
    /// parameter block of `payload_size` bytes.
    pub fn allocate_request(
        &self,
        bss_index: u8,
        command: IoctlCommand,
        payload_size: usize,
    ) -> Result<Request, WlanError> {
        let payload = self.alloc_bytes(payload_size, CounterKind::Request, "request payload")?;
        Ok(Request::new(bss_index, command, payload))
    }

    pub fn free_request(&self, request: Request) {
        drop(request);
    }

    pub fn malloc(&self, size: usize) -> Result<PooledBytes, WlanError> {
        self.alloc_bytes(size, CounterKind::Malloc, "host allocation")
    }

    pub fn new_lock(&self) -> HostLock {
        HostLock {
            inner: Mutex::new(()),
            _guard: CounterGuard::new(&self.counters, CounterKind::Lock),
        }
    }

    /// Creates a disarmed timer whose expiries run `callback` on a
    /// dedicated thread.
    pub fn new_timer(&self, callback: TimerCallback) -> Result<HostTimer, WlanError> {
        let shared = Arc::new(TimerShared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("host-timer".to_string())
            .spawn(move || {
                while thread_shared.wait_expiry() {
                    thread_shared.fired.fetch_add(1, Ordering::SeqCst);
                    callback();
                }
            })
            .map_err(|err| WlanError::allocation(format!("host timer thread: {err}")))?;
        Ok(HostTimer {
            shared,
            handle: Some(handle),
            _guard: CounterGuard::new(&self.counters, CounterKind::Timer),
        })
    }

    pub fn snapshot(&self) -> LeakReport {
        self.counters.snapshot()
    }
}
