//! Reassociation supervisor.
//!
//! One thread per adapter sleeps until it is woken explicitly (link lost,
//! removal) or its retry timer fires, then runs a pass over the station
//! interfaces that lost their network. A pass that leaves any interface
//! disconnected rearms the timer. Failures never leave this module; they
//! only cause a rearm.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::adapter::{Adapter, HardwareStatus};
use crate::dispatch::IoctlCommand;
use crate::error::WlanError;
use crate::interface::Interface;
use crate::sync::{lock, Semaphore};
use crate::types::{BssMode, BssRole, MacAddr, Ssid, SsidBssid};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReassocOutcome {
    /// Interfaces a rejoin was attempted for.
    pub attempted: usize,
    pub reconnected: usize,
    /// The retry timer should be armed.
    pub rearm: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Wake {
    Signal,
    Timer,
    Stop,
}

#[derive(Debug, Default)]
struct WakeState {
    signalled: bool,
    timer: Option<Instant>,
    stop: bool,
}

/// Wake/timer state and the lock shared with foreground scan/connect.
#[derive(Debug)]
pub(crate) struct ReassocControl {
    lock: Arc<Semaphore>,
    enabled: AtomicBool,
    state: Mutex<WakeState>,
    cv: Condvar,
}

impl ReassocControl {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            lock: Semaphore::new("reassoc"),
            enabled: AtomicBool::new(enabled),
            state: Mutex::new(WakeState::default()),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn lock(&self) -> &Arc<Semaphore> {
        &self.lock
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub(crate) fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub(crate) fn wake(&self) {
        lock(&self.state).signalled = true;
        self.cv.notify_all();
    }

    pub(crate) fn arm_timer(&self, interval: Duration) {
        lock(&self.state).timer = Some(Instant::now() + interval);
        self.cv.notify_all();
    }

    pub(crate) fn cancel_timer(&self) {
        lock(&self.state).timer = None;
    }

    pub(crate) fn timer_armed(&self) -> bool {
        lock(&self.state).timer.is_some()
    }

    fn stop(&self) {
        lock(&self.state).stop = true;
        self.cv.notify_all();
    }

    fn wait(&self) -> Wake {
        let mut state = lock(&self.state);
        loop {
            if state.stop {
                return Wake::Stop;
            }
            if state.signalled {
                state.signalled = false;
                return Wake::Signal;
            }
            let now = Instant::now();
            match state.timer {
                Some(deadline) if deadline <= now => {
                    state.timer = None;
                    return Wake::Timer;
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

pub(crate) struct ReassocSupervisor {
    label: String,
    control: Arc<ReassocControl>,
    handle: Option<JoinHandle<()>>,
}

impl ReassocSupervisor {
    pub(crate) fn spawn(
        label: &str,
        control: Arc<ReassocControl>,
        adapter: Weak<Adapter>,
        interval: Duration,
    ) -> io::Result<Self> {
        lock(&control.state).stop = false;
        let thread_control = Arc::clone(&control);
        let thread_label = format!("reassoc{}", label.trim_start_matches("adapter"));
        let name = format!("{label}-reassoc");
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || supervise(&thread_label, &thread_control, &adapter, interval))?;
        Ok(Self {
            label: label.to_string(),
            control,
            handle: Some(handle),
        })
    }

    pub(crate) fn stop(mut self) {
        self.control.stop();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                error!("{}: reassociation thread panicked", self.label);
            }
        }
    }
}

impl Drop for ReassocSupervisor {
    fn drop(&mut self) {
        self.control.stop();
    }
}

fn supervise(label: &str, control: &ReassocControl, adapter: &Weak<Adapter>, interval: Duration) {
    info!("{label}: supervisor started");
    loop {
        let wake = control.wait();
        if wake == Wake::Stop {
            break;
        }
        control.cancel_timer();
        let Some(adapter) = adapter.upgrade() else {
            break;
        };
        if adapter.is_removed() {
            break;
        }
        if adapter.status() != HardwareStatus::Ready {
            trace!("{label}: woken ({wake:?}) while {:?}", adapter.status());
            continue;
        }
        trace!("{label}: woken ({wake:?})");
        let outcome = run_pass(&adapter);
        if adapter.is_removed() {
            break;
        }
        if outcome.rearm {
            debug!("{label}: retry in {interval:?}");
            control.arm_timer(interval);
        }
    }
    info!("{label}: supervisor stopped");
}

/// Looks `target` up in the last scan, by BSSID first and by SSID when that
/// fails.
fn find_network(iface: &Interface, target: &SsidBssid) -> Result<SsidBssid, WlanError> {
    let by_bssid = SsidBssid::new(Ssid::empty(), target.bssid);
    match iface.request(IoctlCommand::FindBestNetwork(by_bssid)) {
        Ok(response) => return response.into_network(),
        Err(err) => trace!("{}: bssid {} not found: {err}", iface.name(), target.bssid),
    }
    let by_ssid = SsidBssid::new(target.ssid.clone(), MacAddr::ZERO);
    iface
        .request(IoctlCommand::FindBestNetwork(by_ssid))?
        .into_network()
}

/// Outcome of one interface within a pass.
enum Attempt {
    Skipped,
    Joined,
    Missed,
    /// Stop the pass here; the rest waits for the next timer.
    Abort,
}

fn reassociate(adapter: &Adapter, iface: &Interface, label: &str) -> Attempt {
    let bss = match iface.get_bss_info() {
        Ok(bss) => bss,
        Err(err) => {
            warn!("{label}: {}: bss info unavailable: {err}", iface.name());
            iface.set_reassoc_required(false);
            return Attempt::Skipped;
        }
    };
    if bss.bss_mode != BssMode::Infra || iface.is_connected() {
        debug!("{label}: {}: ad-hoc or already connected", iface.name());
        iface.set_reassoc_required(false);
        return Attempt::Skipped;
    }
    let Some(target) = iface.last_known_network() else {
        debug!("{label}: {}: no previous network", iface.name());
        iface.set_reassoc_required(false);
        return Attempt::Skipped;
    };

    let wait = adapter.config().reassoc_interval();
    let Some(_permit) = adapter
        .reassoc_lock()
        .acquire_cancellable(wait, &|| adapter.is_removed())
    else {
        debug!("{label}: {}: lock busy", iface.name());
        return Attempt::Abort;
    };
    if adapter.is_removed() {
        return Attempt::Abort;
    }

    if let Err(err) = iface.request(IoctlCommand::Scan {
        ssid: Some(target.ssid.clone()),
    }) {
        error!("{label}: {}: scan for {} failed: {err}", iface.name(), target.ssid);
        return Attempt::Abort;
    }
    if adapter.is_removed() {
        return Attempt::Abort;
    }

    match find_network(iface, &target) {
        Ok(found) => {
            if bss.wep_enabled {
                if let Err(err) = iface.request(IoctlCommand::EnableWepKey) {
                    warn!("{label}: {}: restore wep key failed: {err}", iface.name());
                }
            }
            let join = SsidBssid::new(Ssid::empty(), found.bssid);
            match iface.request(IoctlCommand::BssStart(join)) {
                Ok(_) => {
                    let ssid = if found.ssid.is_empty() {
                        target.ssid.clone()
                    } else {
                        found.ssid
                    };
                    iface.on_connected(SsidBssid::new(ssid, found.bssid));
                }
                Err(err) => debug!("{label}: {}: join {} failed: {err}", iface.name(), found.bssid),
            }
        }
        Err(err) => debug!("{label}: {}: {} not in range: {err}", iface.name(), target.ssid),
    }

    if !iface.is_connected() {
        return Attempt::Missed;
    }
    iface.set_reassoc_required(false);
    if let Some(index) = iface.rate_index() {
        if let Err(err) = iface.request(IoctlCommand::SetRate { index: Some(index) }) {
            warn!("{label}: {}: restore rate {index} failed: {err}", iface.name());
        }
    }
    Attempt::Joined
}

/// One pass over every station interface flagged `reassoc_required`.
pub(crate) fn run_pass(adapter: &Adapter) -> ReassocOutcome {
    let label = format!("reassoc({})", adapter.index());
    let mut outcome = ReassocOutcome::default();
    for iface in adapter.interfaces() {
        if adapter.is_removed() {
            break;
        }
        if iface.role() != BssRole::Sta || !iface.reassoc_required() {
            continue;
        }
        match reassociate(adapter, &iface, &label) {
            Attempt::Skipped => {}
            Attempt::Joined => {
                outcome.attempted += 1;
                outcome.reconnected += 1;
                info!("{label}: {} reassociated", iface.name());
            }
            Attempt::Missed => {
                outcome.attempted += 1;
                outcome.rearm = true;
            }
            Attempt::Abort => {
                outcome.attempted += 1;
                outcome.rearm = true;
                break;
            }
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_signal_is_consumed_once() {
        let control = ReassocControl::new(true);
        control.wake();
        assert_eq!(control.wait(), Wake::Signal);
        control.arm_timer(Duration::from_millis(10));
        assert_eq!(control.wait(), Wake::Timer);
        assert!(!control.timer_armed());
    }

    #[test]
    fn stop_wins_over_pending_wake() {
        let control = ReassocControl::new(true);
        control.wake();
        control.stop();
        assert_eq!(control.wait(), Wake::Stop);
    }

    #[test]
    fn stop_wakes_a_parked_waiter() {
        let control = Arc::new(ReassocControl::new(true));
        let waiter = Arc::clone(&control);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(20));
        control.stop();
        assert_eq!(handle.join().expect("join"), Wake::Stop);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let control = Arc::new(ReassocControl::new(true));
        control.arm_timer(Duration::from_millis(10));
        control.cancel_timer();
        let waiter = Arc::clone(&control);
        let handle = thread::spawn(move || waiter.wait());
        thread::sleep(Duration::from_millis(50));
        control.wake();
        assert_eq!(handle.join().expect("join"), Wake::Signal);
    }
}
