//! Device Probe Tool
//!
//! Lists serial ports, identifies the devices on them, and optionally
//! connects to one and sends commands.
//!
//! Usage:
//!   cargo run --example mculink-probe -- [OPTIONS] [COMMAND...]
//!
//! Options:
//!   --device NAME     Connect to the device answering with NAME
//!   --port PORT       Skip the scan and use PORT for --device
//!   --config DIR      Directory holding <NAME>.INI (default: user config dir)
//!   --long            Use the long read timeout for commands
//!   --all-ports       Probe every port, not just USB/ACM/COM ones
//!   --json            Print the link info as JSON

use anyhow::{bail, Context, Result};
use mculink_core::prelude::*;
use mculink_core::protocol::list_ports;
use tracing_subscriber::EnvFilter;

struct Options {
    device: Option<String>,
    port: Option<String>,
    config_dir: Option<String>,
    long: bool,
    all_ports: bool,
    json: bool,
    commands: Vec<String>,
}

fn parse_args() -> Result<Option<Options>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut options = Options {
        device: None,
        port: None,
        config_dir: None,
        long: false,
        all_ports: false,
        json: false,
        commands: Vec::new(),
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--device" | "-d" => {
                i += 1;
                options.device = Some(args.get(i).context("--device needs a name")?.clone());
            }
            "--port" | "-p" => {
                i += 1;
                options.port = Some(args.get(i).context("--port needs a port")?.clone());
            }
            "--config" | "-c" => {
                i += 1;
                options.config_dir = Some(args.get(i).context("--config needs a directory")?.clone());
            }
            "--long" => options.long = true,
            "--all-ports" => options.all_ports = true,
            "--json" => options.json = true,
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            arg if arg.starts_with('-') => bail!("Unknown option: {}", arg),
            arg => options.commands.push(arg.to_string()),
        }
        i += 1;
    }

    Ok(Some(options))
}

fn print_help() {
    println!("mculink-probe: find and talk to serial microcontroller devices");
    println!();
    println!("Usage: mculink-probe [OPTIONS] [COMMAND...]");
    println!();
    println!("  -d, --device NAME   connect to the device answering with NAME");
    println!("  -p, --port PORT     use PORT instead of scanning");
    println!("  -c, --config DIR    directory holding <NAME>.INI");
    println!("      --long          use the long read timeout for commands");
    println!("      --all-ports     probe every port");
    println!("      --json          print link info as JSON");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(options) = parse_args()? else {
        return Ok(());
    };

    println!("Serial ports:");
    for port in list_ports() {
        let details: Vec<String> = port
            .entries()
            .into_iter()
            .skip(1)
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();
        println!("  {} {}", port.name, details.join(" "));
    }
    println!();

    let mut enumerator = DeviceEnumerator::new();
    if options.all_ports {
        enumerator = enumerator.with_filter(PortFilter::any());
    }

    let port = match (&options.port, &options.device) {
        (Some(port), _) => Some(port.clone()),
        (None, device) => {
            println!("Scanning {} candidate port(s)...", enumerator.candidates().len());
            let registry = enumerator.scan();
            if registry.is_empty() {
                println!("No devices identified.");
            }
            for (identity, port) in registry.entries() {
                println!("  {:<24} {}", identity, port);
            }
            println!();
            device.as_deref().and_then(|d| registry.port_of(d).map(str::to_string))
        }
    };

    let Some(device) = options.device else {
        return Ok(());
    };
    let Some(port) = port else {
        bail!("Device '{}' not found", device);
    };

    let provider = match &options.config_dir {
        Some(dir) => IniConfigProvider::per_device_dir(dir),
        None => IniConfigProvider::default_location(),
    };
    let mut link = DeviceLink::open(&*port, NamedProfile::new(device.clone()), &provider)
        .with_context(|| format!("Cannot open {} at {}", device, port))?;

    if *link.state() != LinkState::Connected {
        bail!("{}: {}", link, link.state());
    }

    for command in &options.commands {
        let bytes = format!("{}\n", command);
        let answer = if options.long {
            link.send_command_long(bytes.as_bytes())
        } else {
            link.send_command(bytes.as_bytes())
        };
        println!("> {}\n< {}", command, answer);
    }

    let info = link.info();
    if options.json {
        println!("{}", info.to_json()?);
    } else {
        println!("\nDevice info:\n{}", info.to_text());
    }

    link.release();
    Ok(())
}
