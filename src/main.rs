use std::path::PathBuf;

use anyhow::{Context, Result};
use ble_mqtt_relay_lib::config::{ble_config::BleRole, default_config_dir};
use ble_mqtt_relay_lib::logging;
use ble_mqtt_relay_lib::state::{AppState, Backend, CentralTargets};
use clap::Parser;
use log::{info, LevelFilter};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ble-mqtt-relay")]
#[command(about = "Relays data between Bluetooth LE devices and an MQTT broker")]
struct Cli {
    /// Directory holding mqtt_config.json and ble_config.json
    #[arg(short, long)]
    config_dir: Option<PathBuf>,

    /// BLE role to run; saved to the settings when given
    #[arg(short, long, value_enum)]
    role: Option<BleRole>,

    /// Use in-memory radio and broker links with demo traffic
    #[arg(long)]
    simulate: bool,

    #[arg(short, long, default_value = "info")]
    log_level: LevelFilter,

    /// Address of a peripheral to connect to in the central role (repeatable)
    #[arg(short, long = "device")]
    devices: Vec<String>,

    /// Characteristic to enable notifications on once connected (repeatable)
    #[arg(long)]
    notify: Vec<Uuid>,

    /// Characteristic to send broker payloads to once connected (repeatable)
    #[arg(long)]
    write: Vec<Uuid>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_level).context("Failed to initialize logging")?;

    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let backend = if cli.simulate { Backend::Simulated } else { Backend::Hardware };
    let targets = CentralTargets {
        devices: cli.devices,
        notify: cli.notify,
        write: cli.write,
    };

    info!("Starting AppState initialization from {:?}", config_dir);
    let state = AppState::new(config_dir, cli.role, backend, targets)
        .await
        .context("Failed to initialize the relay")?;
    state.start();

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    state.shutdown().await;
    Ok(())
}
