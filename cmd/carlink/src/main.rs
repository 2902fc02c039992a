//! carlink - bridge between web clients and the vehicle's serial controller.
//!
//! Usage:
//!   carlink                                   # defaults: /dev/ttyUSB0, :8080, :8081
//!   carlink --config carlink.yaml
//!   carlink --serial-port /dev/ttyACM0 --baud-rate 115200 --reconnect-ms 1000

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use carlink_bridge::{Bridge, BridgeConfig, MonitorHub, MonitorWriter};
use carlink_serial::SystemConnector;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Environment variable naming the config file.
const CONFIG_ENV: &str = "CARLINK_CONFIG";

#[derive(Parser, Debug)]
#[command(name = "carlink")]
#[command(about = "Vehicle command and telemetry bridge")]
#[command(version)]
struct Args {
    /// Config file (YAML). Falls back to $CARLINK_CONFIG.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial device path
    #[arg(long)]
    serial_port: Option<String>,

    /// Serial baud rate
    #[arg(long)]
    baud_rate: Option<u32>,

    /// Control listen address (e.g. ":8080")
    #[arg(long)]
    control_addr: Option<String>,

    /// Monitor listen address (e.g. ":8081")
    #[arg(long)]
    monitor_addr: Option<String>,

    /// Reopen the serial port every N ms while it is closed
    #[arg(long)]
    reconnect_ms: Option<u64>,

    /// Reject move commands with unknown directions
    #[arg(long)]
    strict_direction: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn load_config(&self) -> Result<BridgeConfig> {
        let path = self
            .config
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));

        let mut config = match &path {
            Some(path) => BridgeConfig::load(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => BridgeConfig::default(),
        };

        if let Some(port) = &self.serial_port {
            config.serial.port = port.clone();
        }
        if let Some(baud) = self.baud_rate {
            config.serial.baud_rate = baud;
        }
        if let Some(addr) = &self.control_addr {
            config.control_addr = addr.clone();
        }
        if let Some(addr) = &self.monitor_addr {
            config.monitor_addr = addr.clone();
        }
        if let Some(ms) = self.reconnect_ms {
            config.serial.reconnect_interval_ms = Some(ms);
        }
        if self.strict_direction {
            config.strict_direction = true;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(verbose: bool, monitor: Option<MonitorHub>) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let forward = monitor.map(|hub| {
        tracing_subscriber::fmt::layer()
            .with_writer(MonitorWriter::new(hub))
            .with_ansi(false)
            .with_target(false)
            .without_time()
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(forward)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let monitor = MonitorHub::new();
    init_tracing(
        args.verbose,
        config.monitor.forward_tracing.then(|| monitor.clone()),
    );

    info!(
        "carlink starting: serial {} @ {}, control {}, monitor {}",
        config.serial.port, config.serial.baud_rate, config.control_addr, config.monitor_addr
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {}", e);
                return;
            }
            info!("Shutting down");
            cancel.cancel();
        });
    }

    let bridge = Bridge::new(config, Arc::new(SystemConnector), monitor);
    bridge.run(cancel).await?;
    Ok(())
}
