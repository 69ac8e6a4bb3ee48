//! Blocking synchronization primitives shared by the lifecycle, dispatch and
//! reassociation paths.
//!
//! - [`Semaphore`]: binary semaphore whose permit is an owned value, so it can
//!   be handed to another thread (attach/detach lock, reassociation lock).
//! - [`Signal`]: one-shot completion slot with removal-aware timed waits
//!   (firmware init/shutdown waits, request completion).

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Granularity of cancellable waits. A removal flag set while a thread is
/// parked is observed within one slice.
pub const CANCEL_POLL: Duration = Duration::from_millis(20);

/// Locks `mutex`, recovering the guard if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn wait_slice<'a, T>(
    cv: &Condvar,
    guard: MutexGuard<'a, T>,
    timeout: Duration,
) -> MutexGuard<'a, T> {
    match cv.wait_timeout(guard, timeout) {
        Ok((guard, _)) => guard,
        Err(poisoned) => poisoned.into_inner().0,
    }
}

/// Binary semaphore. Acquisition yields a [`SemaphorePermit`] that releases on
/// drop and may be moved across threads.
#[derive(Debug)]
pub struct Semaphore {
    name: &'static str,
    held: Mutex<bool>,
    cv: Condvar,
}

impl Semaphore {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            held: Mutex::new(false),
            cv: Condvar::new(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn acquire(self: &Arc<Self>) -> SemaphorePermit {
        let mut held = lock(&self.held);
        while *held {
            held = match self.cv.wait(held) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
        *held = true;
        SemaphorePermit {
            sem: Arc::clone(self),
        }
    }

    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<SemaphorePermit> {
        self.acquire_cancellable(timeout, &|| false)
    }

    /// Like [`Semaphore::acquire_timeout`], but gives up once `cancelled`
    /// returns true. The flag is re-evaluated at least every [`CANCEL_POLL`].
    pub fn acquire_cancellable(
        self: &Arc<Self>,
        timeout: Duration,
        cancelled: &dyn Fn() -> bool,
    ) -> Option<SemaphorePermit> {
        let deadline = Instant::now() + timeout;
        let mut held = lock(&self.held);
        while *held {
            let now = Instant::now();
            if now >= deadline || cancelled() {
                return None;
            }
            held = wait_slice(&self.cv, held, CANCEL_POLL.min(deadline - now));
        }
        *held = true;
        Some(SemaphorePermit {
            sem: Arc::clone(self),
        })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<SemaphorePermit> {
        self.acquire_timeout(Duration::ZERO)
    }

    pub fn is_held(&self) -> bool {
        *lock(&self.held)
    }

    fn release(&self) {
        *lock(&self.held) = false;
        self.cv.notify_one();
    }
}

#[must_use = "the semaphore is released as soon as the permit is dropped"]
#[derive(Debug)]
pub struct SemaphorePermit {
    sem: Arc<Semaphore>,
}

impl Drop for SemaphorePermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

/// Outcome of a [`Signal::wait`].
#[derive(Debug, PartialEq, Eq)]
pub enum WaitOutcome<T> {
    Ready(T),
    Cancelled,
    TimedOut,
}

/// Single-value completion slot. `set` stores a value and wakes waiters,
/// `wait` takes it.
#[derive(Debug)]
pub struct Signal<T> {
    slot: Mutex<Option<T>>,
    cv: Condvar,
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Signal<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    pub fn reset(&self) {
        lock(&self.slot).take();
    }

    /// Stores `value`, replacing any value nobody consumed yet.
    pub fn set(&self, value: T) {
        *lock(&self.slot) = Some(value);
        self.cv.notify_all();
    }

    pub fn take(&self) -> Option<T> {
        lock(&self.slot).take()
    }

    /// Waits for a value until `deadline`. `cancelled` is re-evaluated at
    /// least every [`CANCEL_POLL`]; a value already present wins over
    /// cancellation.
    pub fn wait(&self, deadline: Option<Instant>, cancelled: &dyn Fn() -> bool) -> WaitOutcome<T> {
        let mut slot = lock(&self.slot);
        loop {
            if let Some(value) = slot.take() {
                return WaitOutcome::Ready(value);
            }
            if cancelled() {
                return WaitOutcome::Cancelled;
            }
            let mut slice = CANCEL_POLL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return WaitOutcome::TimedOut;
                }
                slice = slice.min(deadline - now);
            }
            slot = wait_slice(&self.cv, slot, slice);
        }
    }
}

/// Sleeps for `duration` in [`CANCEL_POLL`] slices. Returns `false` when
/// `cancelled` fired before the full duration elapsed.
pub(crate) fn sleep_cancellable(duration: Duration, cancelled: &dyn Fn() -> bool) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        if cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        std::thread::sleep(CANCEL_POLL.min(deadline - now));
    }
}
