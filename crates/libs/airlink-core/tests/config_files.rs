use std::fs;
use std::sync::Arc;

use airlink_core::iface_table::DEFAULT_FW_NAME;
use airlink_core::{
    CardId, DirFirmwareSource, HardwareStatus, LifecycleController, MacAddr, ModuleConfig,
    SimSubsystem, WlanError,
};

#[test]
fn attach_from_files_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();
    fs::create_dir_all(root.join("mrvl")).expect("mkdir");
    fs::write(root.join(DEFAULT_FW_NAME), [0xa5u8; 512]).expect("firmware");
    fs::write(
        root.join("wlan.conf"),
        concat!(
            "# board defaults\n",
            "mac_addr=mlan1:02:00:00:00:00:01\n",
            "mac_addr=mlan0:02:00:00:00:00:aa\n",
            "wlan_reg=0,0x1c,1\n",
        ),
    )
    .expect("init config");
    fs::write(root.join("cal.txt"), "0a 0b\n0c\n").expect("calibration");
    fs::write(
        root.join("airlink.toml"),
        r#"
drv_mode = 1
max_sta_bss = 2
init_cfg = "wlan.conf"
cal_data_cfg = "cal.txt"
"#,
    )
    .expect("module config");

    let config = ModuleConfig::from_path(root.join("airlink.toml")).expect("load");
    let sim = Arc::new(SimSubsystem::new());
    let firmware = Arc::new(DirFirmwareSource::new(root));
    let controller =
        LifecycleController::new(config, sim.clone(), firmware).expect("controller");
    let adapter = controller.add_card(CardId(3)).expect("attach");

    assert_eq!(adapter.status(), HardwareStatus::Ready);
    assert_eq!(sim.downloads(), [DEFAULT_FW_NAME]);
    let mlan0 = adapter.interface_by_name("mlan0").expect("mlan0");
    let mlan1 = adapter.interface_by_name("mlan1").expect("mlan1");
    assert_eq!(mlan0.mac(), MacAddr([0x02, 0, 0, 0, 0, 0xaa]));
    assert_eq!(mlan1.mac(), MacAddr([0x02, 0, 0, 0, 0, 0x01]));
    assert_eq!(sim.count("register_write"), 1);
    assert_eq!(sim.count("host_command"), 1);

    let report = controller.remove_card(CardId(3)).expect("remove");
    assert!(report.is_clean());
}

#[test]
fn missing_init_config_fails_attach() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("mrvl")).expect("mkdir");
    fs::write(dir.path().join(DEFAULT_FW_NAME), [1u8; 64]).expect("firmware");

    let config =
        ModuleConfig::from_toml("drv_mode = 1\ninit_cfg = \"absent.conf\"").expect("config");
    let sim = Arc::new(SimSubsystem::new());
    let firmware = Arc::new(DirFirmwareSource::new(dir.path()));
    let controller =
        LifecycleController::new(config, sim.clone(), firmware).expect("controller");
    let err = controller.add_card(CardId(1)).expect_err("no init config");
    assert!(matches!(err, WlanError::NotFound { .. }), "{err:?}");
    assert!(controller.registry().is_empty());
    assert!(sim.live_adapters().is_empty());
}

#[test]
fn invalid_module_config_is_rejected_up_front() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bad.toml");
    fs::write(&path, "max_tx_buf = 1000\n").expect("write");
    assert!(matches!(
        ModuleConfig::from_path(&path),
        Err(WlanError::ConfigurationInvalid { .. })
    ));
    assert!(ModuleConfig::from_path(dir.path().join("missing.toml")).is_err());
}
