// BLE client: scan, connect to one peripheral and exchange characteristic data

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::info;

use ble_client::bluetooth::BleAdapter;
use ble_client::config::load_config;
use ble_client::{app, Session};

#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, default_value = "ble-client.toml")]
    config: PathBuf,

    /// Connection id, MAC address or name of the peripheral to connect to
    #[arg(short, long)]
    target: Option<String>,

    /// Bluetooth adapter, e.g. hci0
    #[arg(short, long)]
    adapter: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::Builder::from_default_env().init();

    let cli = Cli::parse();
    info!("Starting BLE client");

    let mut config = load_config(Some(&cli.config)).context("Failed to load configuration")?;
    if let Some(target) = cli.target {
        config.client.target = Some(target);
    }
    if let Some(adapter) = cli.adapter {
        config.bluetooth.adapter = Some(adapter);
    }
    info!("Configuration loaded successfully");

    let ble_adapter = BleAdapter::new(config.bluetooth.clone())
        .await
        .context("Failed to initialize BLE adapter")?;
    info!("BLE adapter initialized: {}", ble_adapter.name());

    let session = Session::new(Arc::new(ble_adapter), config.session.clone());
    app::run(&session, &config).await
}
