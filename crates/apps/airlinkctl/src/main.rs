use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use airlink_core::iface_table::TableLimits;
use airlink_core::initcfg::{parse_cal_data, parse_init_cfg, InitDirective};
use airlink_core::types::BssRole;
use airlink_core::{
    AdapterEvent, CardId, DirFirmwareSource, FirmwareSource, HardwareStatus, InterfaceTable,
    LifecycleController, MacAddr, MemoryFirmwareSource, ModuleConfig, SimBehavior, SimSubsystem,
    Ssid, SsidBssid,
};
use clap::Parser;
use log::{debug, info};
use serde_json::json;

type CliResult<T> = Result<T, Box<dyn Error>>;

/// Access point the simulator advertises for `--connect`.
const SIM_BSSID: MacAddr = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);

#[derive(Parser, Debug)]
#[command(name = "airlinkctl", about = "Wireless adapter control plane tools", version)]
struct Cli {
    /// Repeat for more log output.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the interface table a module config produces.
    Table {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Parse an init configuration file and list its directives.
    CheckInitCfg { path: PathBuf },
    /// Parse a calibration data file and report its decoded length.
    CheckCal {
        path: PathBuf,
        #[arg(long)]
        dump: bool,
    },
    /// Attach a simulated adapter, report its interfaces, then detach it.
    Simulate {
        #[arg(long)]
        config: Option<PathBuf>,
        /// Resolve firmware, init and calibration files from this directory.
        #[arg(long)]
        firmware_dir: Option<PathBuf>,
        #[arg(long, default_value_t = 1)]
        card: u32,
        /// Join this network on the first station interface.
        #[arg(long)]
        connect: Option<String>,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    if let Err(err) = run(cli) {
        eprintln!("airlinkctl error: {err}");
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .try_init();
}

fn run(cli: Cli) -> CliResult<()> {
    match cli.command {
        Command::Table { config, json } => run_table(config.as_deref(), json),
        Command::CheckInitCfg { path } => run_check_init_cfg(&path),
        Command::CheckCal { path, dump } => run_check_cal(&path, dump),
        Command::Simulate {
            config,
            firmware_dir,
            card,
            connect,
        } => run_simulate(config.as_deref(), firmware_dir, card, connect),
    }
}

fn load_config(path: Option<&Path>) -> CliResult<ModuleConfig> {
    let config = match path {
        Some(path) => ModuleConfig::from_path(path)?,
        None => ModuleConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn run_table(config: Option<&Path>, as_json: bool) -> CliResult<()> {
    let config = load_config(config)?;
    let table = InterfaceTable::from_config(&config, &TableLimits::default())?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&table)?);
        return Ok(());
    }

    println!("mode      0x{:x}", table.mode.bits());
    println!("firmware  {}", table.fw_name);
    println!(
        "counts    sta={} uap={} wfd={}",
        table.counts.sta, table.counts.uap, table.counts.wfd
    );
    for entry in &table.entries {
        println!("slot {}    {} bss_num={}", entry.slot, entry.bss_type, entry.bss_num);
    }
    Ok(())
}

fn run_check_init_cfg(path: &Path) -> CliResult<()> {
    let text = fs::read_to_string(path)?;
    let directives = parse_init_cfg(&text)?;
    debug!("init config {}: {} directives", path.display(), directives.len());
    for directive in &directives {
        match directive {
            InitDirective::MacAddr { ifname, mac } => println!("mac_addr  {ifname} {mac}"),
            InitDirective::RegWrite {
                reg_type,
                offset,
                value,
            } => println!("wlan_reg  type={reg_type} offset=0x{offset:x} value=0x{value:x}"),
        }
    }
    Ok(())
}

fn run_check_cal(path: &Path, dump: bool) -> CliResult<()> {
    let raw = fs::read(path)?;
    let data = parse_cal_data(&raw)?;
    println!("{} bytes", data.len());
    if dump {
        for chunk in data.chunks(16) {
            println!("{}", hex::encode(chunk));
        }
    }
    Ok(())
}

fn firmware_source(
    config: &ModuleConfig,
    dir: Option<PathBuf>,
) -> CliResult<Arc<dyn FirmwareSource>> {
    if let Some(dir) = dir {
        return Ok(Arc::new(DirFirmwareSource::new(dir)));
    }
    // Without a directory only the firmware image itself can be resolved.
    let table = InterfaceTable::from_config(config, &TableLimits::default())?;
    let image: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
    Ok(Arc::new(MemoryFirmwareSource::new().with_image(table.fw_name, image)))
}

fn run_simulate(
    config_path: Option<&Path>,
    firmware_dir: Option<PathBuf>,
    card: u32,
    connect: Option<String>,
) -> CliResult<()> {
    let config = load_config(config_path)?;
    let firmware = firmware_source(&config, firmware_dir)?;
    let settle = config.fw_request_timeout() + config.fw_init_timeout();

    let target = connect
        .map(|ssid| ssid.parse::<Ssid>().map(|ssid| SsidBssid::new(ssid, SIM_BSSID)))
        .transpose()?;
    let behavior = SimBehavior {
        scan_table: target.iter().cloned().collect(),
        ..SimBehavior::default()
    };
    let sim = Arc::new(SimSubsystem::with_behavior(behavior));
    let controller = LifecycleController::new(config, sim.clone(), firmware)?;
    let events = controller.events().subscribe(64)?;

    let card = CardId(card);
    let adapter = controller.add_card(card)?;
    let status = adapter.wait_settled(settle);
    if status != HardwareStatus::Ready {
        let reason = adapter
            .failure()
            .map(|err| err.to_string())
            .unwrap_or_else(|| format!("adapter settled in {status:?}"));
        return Err(reason.into());
    }
    info!("sim: card {} ready with {} interfaces", card.0, adapter.interface_count());

    if let Some(network) = target {
        let station = adapter
            .interfaces()
            .into_iter()
            .find(|iface| iface.role() == BssRole::Sta)
            .ok_or("no station interface to connect")?;
        station.connect(network.clone())?;
        if let Some(adapter_ref) = adapter.adapter_ref() {
            sim.emit_event(adapter_ref, station.bss_index(), AdapterEvent::Connected(network))?;
        }
    }

    let interfaces: Vec<_> = adapter
        .interfaces()
        .iter()
        .map(|iface| {
            json!({
                "name": iface.name(),
                "bss_index": iface.bss_index(),
                "bss_type": iface.bss_type().to_string(),
                "mac": iface.mac().to_string(),
                "connected": iface.is_connected(),
                "link": iface.link(),
            })
        })
        .collect();

    let report = controller.remove_card(card)?;
    let relayed: Vec<String> = events
        .try_iter()
        .map(|frame| {
            format!(
                "{}: {}",
                frame.ifname(),
                String::from_utf8_lossy(frame.payload())
            )
        })
        .collect();

    let summary = json!({
        "card": card.0,
        "drv_mode": adapter.drv_mode().bits(),
        "interfaces": interfaces,
        "events": relayed,
        "commands": sim.journal().len(),
        "leaks": report,
        "clean": report.is_clean(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
