use std::fs;
use std::process::{Command, Output};

fn airlinkctl(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_airlinkctl"))
        .args(args)
        .output()
        .expect("spawn airlinkctl")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn table_reports_default_layout_as_json() {
    let output = airlinkctl(&["table", "--json"]);
    assert!(output.status.success(), "{output:?}");
    let table: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    let entries = table["entries"].as_array().expect("entries");
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0]["bss_type"], "sta");
    assert_eq!(entries[1]["bss_type"], "uap");
}

#[test]
fn table_rejects_empty_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("airlink.toml");
    fs::write(&path, "drv_mode = 0\n").expect("write");
    let output = airlinkctl(&["table", "--config", path.to_str().expect("utf8")]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("airlinkctl error"));
}

#[test]
fn check_init_cfg_lists_directives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("wlan.conf");
    fs::write(&path, "mac_addr=mlan0:02:00:00:00:00:aa\nwlan_reg=0,0x10,0x2\n").expect("write");
    let output = airlinkctl(&["check-init-cfg", path.to_str().expect("utf8")]);
    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    assert!(text.contains("mac_addr  mlan0 02:00:00:00:00:aa"), "{text}");
    assert!(text.contains("wlan_reg  type=0 offset=0x10 value=0x2"), "{text}");
}

#[test]
fn check_cal_counts_decoded_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("cal.txt");
    fs::write(&path, "01 02\n0304\n").expect("write");
    let output = airlinkctl(&["check-cal", path.to_str().expect("utf8"), "--dump"]);
    assert!(output.status.success(), "{output:?}");
    let text = stdout(&output);
    assert!(text.starts_with("4 bytes"), "{text}");
    assert!(text.contains("01020304"), "{text}");
}

#[test]
fn simulate_attaches_connects_and_detaches_cleanly() {
    let output = airlinkctl(&["simulate", "--card", "7", "--connect", "home"]);
    assert!(output.status.success(), "{output:?}");
    let summary: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(summary["card"], 7);
    assert_eq!(summary["clean"], true);
    let interfaces = summary["interfaces"].as_array().expect("interfaces");
    assert_eq!(interfaces[0]["name"], "mlan0");
    assert_eq!(interfaces[0]["connected"], true);
    assert_eq!(interfaces[1]["name"], "uap0");
}
