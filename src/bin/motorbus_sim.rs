use clap::{App, Arg, ArgMatches, SubCommand};
use colored::*;
use motorbus::{
    api, split, BusHandle, Command, Engine, EngineConfig, FirmwareImage, SimBus, SimPeer, StatusSnapshot,
    UpdateProgress,
};
use std::time::Duration;
use tokio::time;
use tracing::{debug, Level};

type CliError = Box<dyn std::error::Error + Send + Sync>;

const DEFAULT_PEERS: &str = "1,2,3";
const DEFAULT_TARGET: &str = "1";
// Ticks to let the status sweep run before reporting.
const STATUS_SETTLE_TICKS: u32 = 200;
const SEND_SETTLE_TICKS: u32 = 20;

enum Action {
    Enumerate,
    Status,
    Read(String),
    Send(Command),
    Update(usize),
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let matches = App::new("motorbus-sim")
        .version("0.1.0")
        .author("Motor Control Systems Team")
        .about("Drives simulated motor controllers through the motorbus engine")
        .arg(
            Arg::with_name("peers")
                .long("peers")
                .value_name("DEVICES")
                .help("Comma-separated device numbers of the simulated controllers")
                .takes_value(true)
                .default_value(DEFAULT_PEERS)
                .global(true),
        )
        .arg(
            Arg::with_name("target")
                .short("t")
                .long("target")
                .value_name("DEVICE")
                .help("Device number to address")
                .takes_value(true)
                .default_value(DEFAULT_TARGET)
                .global(true)
                .validator(|v| match v.parse::<u8>() {
                    Ok(1..=63) => Ok(()),
                    _ => Err("Target must be a device number in 1..=63".into()),
                }),
        )
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Engine configuration as JSON")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("table")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Enable debug logging")
                .global(true),
        )
        .subcommand(SubCommand::with_name("enumerate").about("Discover the controllers on the bus"))
        .subcommand(SubCommand::with_name("status").about("Poll and print the target's status"))
        .subcommand(
            SubCommand::with_name("read")
                .about("Read a parameter from the target")
                .arg(
                    Arg::with_name("class")
                        .help("Parameter name, e.g. spd_pc or status_power")
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("send")
                .about("Send a command given as JSON")
                .arg(
                    Arg::with_name("command")
                        .help(r#"Command, e.g. '{"VoltageSet":{"value":8000,"group":0}}'"#)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("update")
                .about("Download a synthetic firmware image to the target")
                .arg(
                    Arg::with_name("size")
                        .help("Image size in bytes")
                        .required(true)
                        .validator(|v| match v.parse::<usize>() {
                            Ok(size) if size >= 8 => Ok(()),
                            _ => Err("Size must be a number of at least 8".into()),
                        }),
                ),
        )
        .get_matches();

    let verbose = matches.is_present("verbose");
    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::WARN })
        .init();

    let action = match parse_action(&matches)? {
        Some(action) => action,
        None => {
            println!("{}", "No command specified. Use --help for usage information.".yellow());
            println!("{}", "Quick start:".bright_green());
            println!("  {} Discover controllers", "motorbus-sim enumerate".bright_cyan());
            println!("  {} Show target status", "motorbus-sim status -t 2".bright_cyan());
            return Ok(());
        }
    };

    let config = match matches.value_of("config") {
        Some(path) => EngineConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => EngineConfig::default(),
    };
    let peers = parse_peers(matches.value_of("peers").unwrap_or(DEFAULT_PEERS))?;
    let target: u8 = matches.value_of("target").unwrap_or(DEFAULT_TARGET).parse()?;
    let json = matches.value_of("format") == Some("json");

    let mut bus = SimBus::new();
    for &device in &peers {
        bus.add_peer(SimPeer::new(device).powered_on());
    }
    debug!(?peers, "simulated bus ready");

    let (handle, mut dispatcher) = split(Engine::new(config), bus);
    let ticker = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_millis(1));
        loop {
            interval.tick().await;
            dispatcher.bus_mut().advance(1);
            dispatcher.tick();
        }
    });

    let result = tokio::task::spawn_blocking(move || run(&handle, action, target, json)).await?;
    ticker.abort();
    result
}

fn parse_action(matches: &ArgMatches<'_>) -> Result<Option<Action>, CliError> {
    let action = match matches.subcommand() {
        ("enumerate", _) => Action::Enumerate,
        ("status", _) => Action::Status,
        ("read", Some(sub_matches)) => Action::Read(sub_matches.value_of("class").unwrap_or_default().to_string()),
        ("send", Some(sub_matches)) => {
            Action::Send(serde_json::from_str(sub_matches.value_of("command").unwrap_or_default())?)
        }
        ("update", Some(sub_matches)) => Action::Update(sub_matches.value_of("size").unwrap_or("0").parse()?),
        _ => return Ok(None),
    };
    Ok(Some(action))
}

fn parse_peers(list: &str) -> Result<Vec<u8>, CliError> {
    let mut peers = Vec::new();
    for item in list.split(',').map(str::trim).filter(|item| !item.is_empty()) {
        let device: u8 = item.parse()?;
        if !(1..=63).contains(&device) {
            return Err(format!("peer device number {} is not in 1..=63", device).into());
        }
        peers.push(device);
    }
    Ok(peers)
}

fn run(handle: &BusHandle, action: Action, target: u8, json: bool) -> Result<(), CliError> {
    match action {
        Action::Enumerate => {
            let present = handle.enumerate()?;
            if json {
                println!("{}", serde_json::to_string(&present.devices().to_vec())?);
            } else if present.is_empty() {
                println!("{} {}", "❌".red(), "No controllers answered".bright_red());
            } else {
                println!("{} {}", "🔎".bright_blue(), "Controllers present".bright_blue().bold());
                for device in present.devices() {
                    println!("  {} {}", "device".bright_white(), device.to_string().bright_green());
                }
            }
        }
        Action::Status => {
            select(handle, target)?;
            handle.enable_status_polling();
            handle.wait_ticks(STATUS_SETTLE_TICKS)?;
            print_snapshot(&handle.snapshot(), json)?;
        }
        Action::Read(name) => {
            let class = api::by_name(&name).ok_or_else(|| format!("unknown parameter class '{}'", name))?;
            select(handle, target)?;
            let value = handle.read_parameter(class)?;
            if json {
                println!("{}", serde_json::to_string(&value.to_vec())?);
            } else {
                let hex: Vec<String> = value.iter().map(|byte| format!("{:02x}", byte)).collect();
                println!("{} {}", format!("{}:", name).bright_white(), hex.join(" ").bright_green());
            }
        }
        Action::Send(command) => {
            select(handle, target)?;
            handle.send(&command)?;
            handle.wait_ticks(SEND_SETTLE_TICKS)?;
            let stats = handle.get_stats();
            if json {
                println!("{}", serde_json::to_string(&stats)?);
            } else {
                println!("{} {:?}", "✅ Sent".bright_green(), command);
                println!(
                    "{} {} sent, {} timed out",
                    "Bus:".bright_white(),
                    stats.scheduler.total_sent,
                    stats.scheduler.send_timeouts + stats.scheduler.ack_timeouts
                );
            }
        }
        Action::Update(size) => {
            select(handle, target)?;
            let data = synthetic_image(size);
            let image = FirmwareImage::new(&data)?;
            let mut last = 0;
            handle.update_firmware(&image, |progress: UpdateProgress| {
                let percent = progress.percent();
                if !json && percent >= last + 10 {
                    last = percent;
                    println!("  {} {}%", "programming".dimmed(), percent);
                }
            })?;
            if json {
                println!("{}", serde_json::json!({ "device": target, "size": size, "updated": true }));
            } else {
                println!("{} {}", "✅".green(), format!("Device {} updated", target).bright_green());
            }
        }
    }
    Ok(())
}

fn select(handle: &BusHandle, target: u8) -> Result<(), CliError> {
    handle.set_target_address(target)?;
    debug!(target, capable = handle.can_read(), "target ready");
    Ok(())
}

fn print_snapshot(snapshot: &StatusSnapshot, json: bool) -> Result<(), CliError> {
    if json {
        println!("{}", serde_json::to_string_pretty(snapshot)?);
        return Ok(());
    }

    let show = |label: &str, value: Option<String>| match value {
        Some(value) => println!("  {:<14} {}", label.bright_white(), value.bright_green()),
        None => println!("  {:<14} {}", label.bright_white(), "--".dimmed()),
    };
    println!("{} {}", "📊".bright_blue(), format!("Device {} status", snapshot.target).bright_blue().bold());
    show("Output", snapshot.vout_percent.map(|v| format!("{:.1} %", v)));
    show("Bus voltage", snapshot.vbus_volts.map(|v| format!("{:.2} V", v)));
    show("Current", snapshot.current_amps.map(|v| format!("{:.2} A", v)));
    show("Temperature", snapshot.temperature_c.map(|v| format!("{:.1} °C", v)));
    show("Position", snapshot.position_revs.map(|v| format!("{:.3} rev", v)));
    show("Speed", snapshot.speed_rpm.map(|v| format!("{:.1} rpm", v)));
    show("Limits", snapshot.limit.map(|v| format!("{:#04x}", v)));
    show("Faults", snapshot.fault.map(|v| format!("{:#06x}", v)));
    show("Firmware", snapshot.firmware_version.map(|v| v.to_string()));
    Ok(())
}

/// An image with a plausible vector table followed by a byte ramp.
fn synthetic_image(size: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..size).map(|index| index as u8).collect();
    data[..4].copy_from_slice(&0x2000_1000u32.to_le_bytes());
    data[4..8].copy_from_slice(&0x0000_0801u32.to_le_bytes());
    data
}
