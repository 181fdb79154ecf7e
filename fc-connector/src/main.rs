//! Fibre Channel connector CLI
//!
//! Thin front end over the `fc_connector` library for attaching, detaching
//! and resizing FC volumes by hand or from scripts. Connection properties
//! are read as JSON from a file or stdin; results go to stdout as JSON and
//! logs go to stderr.

use std::io::Read;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fc_connector::fc::{get_fc_hbas_info, get_fc_wwnns, get_fc_wwpns};
use fc_connector::{ConnectionProperties, ConnectorConfig, DeviceInfo, FibreChannelConnector};
use fc_connector::{Host, LinuxHost};
use serde::Serialize;
use tracing::{Level, debug};
use tracing_subscriber::FmtSubscriber;

/// CLI arguments for the FC connector
#[derive(Parser, Debug)]
#[command(name = "fc-connector")]
#[command(about = "Attach and detach Fibre Channel volumes on Linux")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    #[command(flatten)]
    config: ConnectorConfig,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach a volume and print its device info
    Connect {
        /// Connection properties JSON file, or `-` for stdin
        #[arg(long)]
        properties: String,
    },
    /// Detach a volume, removing its SCSI devices
    Disconnect {
        /// Connection properties JSON file, or `-` for stdin
        #[arg(long)]
        properties: String,
        /// Device info JSON printed by `connect`
        #[arg(long)]
        device_info: Option<PathBuf>,
    },
    /// Rescan a volume's devices after it was resized and print the new size
    Extend {
        /// Connection properties JSON file, or `-` for stdin
        #[arg(long)]
        properties: String,
    },
    /// List the FC HBAs of this host
    Hbas,
    /// List the WWPNs of the online HBAs
    Wwpns,
    /// List the WWNNs of the online HBAs
    Wwnns,
    /// List the volume's device paths that currently exist
    Paths {
        /// Connection properties JSON file, or `-` for stdin
        #[arg(long)]
        properties: String,
    },
}

fn read_input(source: &str) -> Result<String, Box<dyn std::error::Error>> {
    if source == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        Ok(buf)
    } else {
        Ok(std::fs::read_to_string(source)?)
    }
}

fn read_properties(source: &str) -> Result<ConnectionProperties, Box<dyn std::error::Error>> {
    let text = read_input(source)?;
    let props = serde_json::from_str(&text)?;
    debug!(source = %source, "Loaded connection properties");
    Ok(props)
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run<H: Host>(
    connector: &FibreChannelConnector<H>,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Connect { properties } => {
            let props = read_properties(&properties)?;
            let device = connector.connect_volume(&props).await?;
            print_json(&device)?;
        }
        Command::Disconnect {
            properties,
            device_info,
        } => {
            let props = read_properties(&properties)?;
            let device_info: Option<DeviceInfo> = match device_info {
                Some(path) => Some(serde_json::from_str(&std::fs::read_to_string(path)?)?),
                None => None,
            };
            connector
                .disconnect_volume(&props, device_info.as_ref())
                .await?;
        }
        Command::Extend { properties } => {
            let props = read_properties(&properties)?;
            let size = connector.extend_volume(&props).await?;
            println!("{}", size);
        }
        Command::Hbas => print_json(&get_fc_hbas_info(connector.host()).await?)?,
        Command::Wwpns => print_json(&get_fc_wwpns(connector.host()).await?)?,
        Command::Wwnns => print_json(&get_fc_wwnns(connector.host()).await?)?,
        Command::Paths { properties } => {
            let props = read_properties(&properties)?.normalize()?;
            print_json(&connector.get_volume_paths(&props.targets).await?)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    debug!(config = ?args.config, "Starting FC connector");
    let connector = FibreChannelConnector::with_config(LinuxHost::new(), args.config);
    run(&connector, args.command).await
}
