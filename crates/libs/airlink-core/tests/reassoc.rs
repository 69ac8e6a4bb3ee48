mod common;

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use airlink_core::{
    Adapter, AdapterEvent, IoctlCommand, MacAddr, ModuleConfig, SimBehavior, Ssid, SsidBssid,
};

use common::{adapter_ref, config, iface, network, wait_for, Harness};

/// Adapter with `mlan0` connected to `home` and then dropped by the AP
/// without waking the supervisor.
fn lost_link(h: &Harness) -> Arc<Adapter> {
    lost_link_to(h, network("home", 1))
}

fn lost_link_to(h: &Harness, previous: SsidBssid) -> Arc<Adapter> {
    let adapter = h.attach(1);
    let mlan0 = iface(&adapter, "mlan0");
    mlan0.connect(previous).expect("connect");

    adapter.set_reassoc_enabled(false);
    h.sim
        .emit_event(adapter_ref(&adapter), 0, AdapterEvent::LinkLost)
        .expect("link lost");
    adapter.set_reassoc_enabled(true);
    assert!(!mlan0.is_connected());
    mlan0.set_reassoc_required(true);
    h.sim.clear_journal();
    adapter
}

fn slow_timer() -> ModuleConfig {
    config("reassoc_interval_ms = 60000")
}

#[test]
fn pass_without_match_rearms_and_keeps_flag() {
    let h = Harness::new(slow_timer());
    let adapter = lost_link(&h);
    h.sim.update(|b| b.scan_table.clear());

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.attempted, 1);
    assert_eq!(outcome.reconnected, 0);
    assert!(outcome.rearm);
    assert!(iface(&adapter, "mlan0").reassoc_required());
    assert!(!iface(&adapter, "mlan0").is_connected());
    assert!(adapter.reassoc_timer_armed());

    let home: Ssid = "home".parse().expect("ssid");
    assert!(h
        .sim
        .journal()
        .contains(&(0, IoctlCommand::Scan { ssid: Some(home) })));
    // BSSID lookup first, then SSID.
    assert_eq!(h.sim.count("find_best_network"), 2);
    assert_eq!(h.sim.count("bss_start"), 0);
}

#[test]
fn pass_rejoins_by_ssid_when_bssid_moved() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 9)],
            ..SimBehavior::default()
        },
    );
    let adapter = lost_link(&h);

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.reconnected, 1);
    assert!(!outcome.rearm);
    let mlan0 = iface(&adapter, "mlan0");
    assert!(mlan0.is_connected());
    assert!(!mlan0.reassoc_required());
    assert_eq!(mlan0.last_known_network(), Some(network("home", 9)));
    assert!(!adapter.reassoc_timer_armed());

    let join = SsidBssid::new(Ssid::empty(), MacAddr([0x02, 0, 0, 0, 0, 9]));
    assert!(h.sim.journal().contains(&(0, IoctlCommand::BssStart(join))));
}

#[test]
fn unknown_bssid_still_looks_up_bssid_before_ssid() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 3)],
            ..SimBehavior::default()
        },
    );
    let home: Ssid = "home".parse().expect("ssid");
    let adapter = lost_link_to(&h, SsidBssid::new(home.clone(), MacAddr::ZERO));
    let mlan0 = iface(&adapter, "mlan0");
    assert_eq!(mlan0.last_known_network().map(|net| net.bssid), Some(MacAddr::ZERO));

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.reconnected, 1);
    let lookups: Vec<SsidBssid> = h
        .sim
        .journal()
        .into_iter()
        .filter_map(|(_, command)| match command {
            IoctlCommand::FindBestNetwork(target) => Some(target),
            _ => None,
        })
        .collect();
    assert_eq!(
        lookups,
        [
            SsidBssid::new(Ssid::empty(), MacAddr::ZERO),
            SsidBssid::new(home, MacAddr::ZERO),
        ]
    );
    assert_eq!(mlan0.last_known_network(), Some(network("home", 3)));
}

#[test]
fn rejoin_restores_wep_key_and_fixed_rate() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 1)],
            wep_enabled: true,
            ..SimBehavior::default()
        },
    );
    let adapter = lost_link(&h);
    iface(&adapter, "mlan0").set_rate(Some(5)).expect("rate");

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.reconnected, 1);
    let commands: Vec<&'static str> = h
        .sim
        .journal()
        .iter()
        .map(|(_, command)| command.name())
        .filter(|name| matches!(*name, "enable_wep_key" | "bss_start" | "set_rate"))
        .collect();
    assert_eq!(commands, ["set_rate", "enable_wep_key", "bss_start", "set_rate"]);
}

#[test]
fn failed_scan_aborts_and_rearms() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 1)],
            fail_scan: true,
            ..SimBehavior::default()
        },
    );
    let adapter = lost_link(&h);

    let outcome = adapter.run_reassoc_pass();
    assert!(outcome.rearm);
    assert_eq!(h.sim.count("find_best_network"), 0);
    assert!(iface(&adapter, "mlan0").reassoc_required());
}

#[test]
fn busy_lock_defers_to_the_next_timer() {
    let h = Harness::with_behavior(
        config("reassoc_interval_ms = 100"),
        SimBehavior {
            scan_table: vec![network("home", 1)],
            ..SimBehavior::default()
        },
    );
    let adapter = lost_link(&h);

    let permit = adapter.reassoc_lock().acquire();
    let outcome = adapter.run_reassoc_pass();
    assert!(outcome.rearm);
    assert_eq!(h.sim.count("scan"), 0);
    assert!(iface(&adapter, "mlan0").reassoc_required());
    drop(permit);

    // The armed timer lets the supervisor finish the job.
    assert!(wait_for(Duration::from_secs(3), || iface(&adapter, "mlan0").is_connected()));
}

#[test]
fn removal_interrupts_wait_for_busy_lock() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 1)],
            ..SimBehavior::default()
        },
    );
    let adapter = lost_link(&h);
    let _permit = adapter.reassoc_lock().acquire();

    let remover = Arc::clone(&adapter);
    let worker = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        remover.surprise_remove();
    });
    let started = Instant::now();
    let outcome = adapter.run_reassoc_pass();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(outcome.reconnected, 0);
    assert_eq!(h.sim.count("scan"), 0);
    worker.join().expect("join");
}

#[test]
fn access_points_are_not_reassociated() {
    let h = Harness::new(slow_timer());
    let adapter = h.attach(1);
    iface(&adapter, "uap0").set_reassoc_required(true);

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.attempted, 0);
    assert!(!outcome.rearm);
    assert_eq!(h.sim.count("scan"), 0);
}

#[test]
fn interface_without_history_is_skipped() {
    let h = Harness::new(slow_timer());
    let adapter = h.attach(1);
    let mlan0 = iface(&adapter, "mlan0");
    mlan0.set_reassoc_required(true);

    let outcome = adapter.run_reassoc_pass();
    assert_eq!(outcome.attempted, 0);
    assert!(!mlan0.reassoc_required());
}

#[test]
fn link_lost_wakes_supervisor_which_rejoins() {
    let h = Harness::with_behavior(
        slow_timer(),
        SimBehavior {
            scan_table: vec![network("home", 1)],
            ..SimBehavior::default()
        },
    );
    let adapter = h.attach(1);
    let mlan0 = iface(&adapter, "mlan0");
    mlan0.connect(network("home", 1)).expect("connect");

    h.sim
        .emit_event(adapter_ref(&adapter), 0, AdapterEvent::LinkLost)
        .expect("link lost");
    assert!(wait_for(Duration::from_secs(3), || mlan0.is_connected()
        && !mlan0.reassoc_required()));
    assert!(h.sim.count("bss_start") >= 2);
}

#[test]
fn disabled_reassociation_ignores_link_loss() {
    let h = Harness::new(config("reassoc = false"));
    let adapter = h.attach(1);
    let mlan0 = iface(&adapter, "mlan0");
    mlan0.connect(network("home", 1)).expect("connect");

    h.sim
        .emit_event(adapter_ref(&adapter), 0, AdapterEvent::LinkLost)
        .expect("link lost");
    assert!(!mlan0.is_connected());
    assert!(!mlan0.reassoc_required());
    assert!(!adapter.reassoc_timer_armed());
}

#[test]
fn removal_stops_a_supervisor_with_armed_timer() {
    let h = Harness::new(config("reassoc_interval_ms = 50"));
    let adapter = lost_link(&h);
    h.sim.update(|b| b.scan_table.clear());
    assert!(adapter.run_reassoc_pass().rearm);

    let report = h
        .controller
        .remove_card(adapter.card())
        .expect("remove");
    assert!(report.is_clean(), "leaks: {report:?}");
    let scans = h.sim.count("scan");
    thread::sleep(Duration::from_millis(150));
    assert_eq!(h.sim.count("scan"), scans);
}
