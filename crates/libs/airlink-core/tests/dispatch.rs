mod common;

use std::thread;
use std::time::{Duration, Instant};

use airlink_core::dispatch::RequestCategory;
use airlink_core::{
    CardId, IoctlCommand, IoctlResponse, ModuleConfig, SimBehavior, SimRequests, Submission,
    WaitMode, WlanError,
};

use common::{config, iface, wait_for, Harness};

fn deferred() -> SimBehavior {
    SimBehavior {
        requests: SimRequests::Deferred(Duration::from_millis(30)),
        ..SimBehavior::default()
    }
}

#[test]
fn blocking_request_waits_for_deferred_completion() {
    let h = Harness::with_behavior(ModuleConfig::default(), deferred());
    let adapter = h.attach(1);
    let info = iface(&adapter, "mlan0").get_bss_info().expect("bss info");
    assert!(!info.media_connected);
    assert_eq!(adapter.pending().get(RequestCategory::Ioctl), 0);
}

#[test]
fn polled_request_completes_later() {
    let h = Harness::with_behavior(ModuleConfig::default(), deferred());
    let adapter = h.attach(1);
    let request = adapter
        .pool()
        .allocate_request(0, IoctlCommand::GetFwInfo, 0)
        .expect("request");

    let submission = adapter
        .submit(request, WaitMode::NonBlockingPoll)
        .expect("submit");
    let Submission::Pending(pending) = submission else {
        panic!("expected a pending submission");
    };
    assert_eq!(adapter.pending().get(RequestCategory::Ioctl), 1);
    let deadline = Instant::now() + Duration::from_secs(2);
    let result = loop {
        if let Some(result) = pending.poll() {
            break result;
        }
        assert!(Instant::now() < deadline, "request never completed");
        thread::sleep(Duration::from_millis(5));
    };
    assert!(matches!(result, Ok(IoctlResponse::FwInfo(_))));
    assert_eq!(adapter.pending().get(RequestCategory::Ioctl), 0);
}

#[test]
fn fire_and_forget_balances_pending_counter() {
    let h = Harness::with_behavior(ModuleConfig::default(), deferred());
    let adapter = h.attach(1);
    let request = adapter
        .pool()
        .allocate_request(1, IoctlCommand::HostCommand, 16)
        .expect("request");

    assert!(matches!(
        adapter.submit(request, WaitMode::FireAndForget),
        Ok(Submission::Detached)
    ));
    assert!(wait_for(Duration::from_secs(2), || {
        adapter.pending().get(RequestCategory::Ioctl) == 0
            && adapter.pool().counters().request_count() == 0
    }));
}

#[test]
fn surprise_removal_unblocks_outstanding_request() {
    let h = Harness::new(ModuleConfig::default());
    let adapter = h.attach(1);
    h.sim.update(|b| b.requests = SimRequests::Hold);

    let mlan0 = iface(&adapter, "mlan0");
    let waiter = thread::spawn(move || mlan0.get_bss_info());
    assert!(wait_for(Duration::from_secs(2), || h.sim.held_requests() == 1));

    let started = Instant::now();
    adapter.surprise_remove();
    let result = waiter.join().expect("join");
    assert_eq!(result, Err(WlanError::Removed));
    assert!(started.elapsed() < Duration::from_secs(1));

    // Later submissions fail without reaching the subsystem.
    let before = h.sim.journal().len();
    assert_eq!(
        iface(&adapter, "uap0").get_bss_info(),
        Err(WlanError::Removed)
    );
    assert_eq!(h.sim.journal().len(), before);

    let report = h.controller.remove_card(CardId(1)).expect("remove");
    assert_eq!(report.ioctl_pending, 0);
    assert_eq!(h.sim.held_requests(), 0);
    assert!(adapter.leak_report().is_clean());
}

#[test]
fn remove_card_unblocks_outstanding_request() {
    let h = Harness::new(ModuleConfig::default());
    let adapter = h.attach(1);
    h.sim.update(|b| b.requests = SimRequests::Hold);

    let mlan0 = iface(&adapter, "mlan0");
    let waiter = thread::spawn(move || mlan0.get_bss_info());
    assert!(wait_for(Duration::from_secs(2), || h.sim.held_requests() == 1));

    h.controller.remove_card(CardId(1)).expect("remove");
    assert_eq!(waiter.join().expect("join"), Err(WlanError::Removed));
    assert!(adapter.leak_report().is_clean());
}

#[test]
fn request_timeout_is_reported() {
    let h = Harness::new(config("ioctl_timeout_ms = 100"));
    let adapter = h.attach(1);
    h.sim.update(|b| b.requests = SimRequests::Hold);

    let err = iface(&adapter, "mlan0").get_bss_info().expect_err("held");
    assert!(matches!(err, WlanError::Timeout { .. }), "{err:?}");
    assert!(err.is_retryable());

    // A late completion still balances the counters.
    assert_eq!(h.sim.release_held_requests(None), 1);
    assert_eq!(adapter.pending().get(RequestCategory::Ioctl), 0);
}

#[test]
fn rejected_request_does_not_leak_pending_count() {
    let h = Harness::new(ModuleConfig::default());
    let adapter = h.attach(1);
    h.sim.update(|b| b.fail_scan = true);

    let err = iface(&adapter, "mlan0").scan(None).expect_err("scan refused");
    assert!(matches!(err, WlanError::Subsystem { .. }));
    assert_eq!(adapter.pending().get(RequestCategory::Ioctl), 0);
    assert!(!adapter.reassoc_lock().is_held());
}

#[test]
fn oversize_request_payload_is_an_allocation_failure() {
    let h = Harness::new(config("max_request_payload = 64"));
    let adapter = h.attach(1);
    let err = adapter
        .pool()
        .allocate_request(0, IoctlCommand::HostCommand, 65)
        .expect_err("too large");
    assert!(matches!(err, WlanError::AllocationFailure { .. }));
    assert_eq!(adapter.pool().counters().request_count(), 0);
}
