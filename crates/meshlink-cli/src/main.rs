//! meshlink - talk to a single Meshtastic radio from the command line
//!
//! Subcommands:
//! - `discover` lists radios found over mDNS (or BLE with the `ble` feature)
//! - `connect` opens a link and prints every frame and log line
//! - `ota-wifi` / `ota-ble` push a firmware image

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use meshlink::{
    Connection, ConnectionEvent, DiscoveryEvent, EventStream, LinkConfig, OtaStatus, RawFrame,
    TcpTransport, WifiOtaUpdater,
};

#[derive(Parser)]
#[command(name = "meshlink")]
#[command(about = "Link and firmware-update tool for Meshtastic radios")]
struct Args {
    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum Medium {
    Tcp,
    Ble,
}

#[derive(Subcommand)]
enum Command {
    /// Browse for radios and print what is found
    Discover {
        /// Transport to browse
        #[arg(long, value_enum, default_value = "tcp")]
        transport: Medium,

        /// How long to browse for
        #[arg(long, default_value_t = 10)]
        seconds: u64,
    },

    /// Connect and print incoming frames until interrupted
    Connect {
        /// `host[:port]` for TCP, peripheral id for BLE
        target: String,

        /// Transport to connect over
        #[arg(long, value_enum, default_value = "tcp")]
        transport: Medium,
    },

    /// Update firmware over WiFi
    OtaWifi {
        /// Device host name or address
        host: String,

        /// Firmware image
        firmware: PathBuf,

        /// Update password, if the device asks for one
        #[arg(long)]
        password: Option<String>,
    },

    /// Update firmware over Bluetooth (first device in update mode)
    OtaBle {
        /// Firmware image
        firmware: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over -v
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match &args.config {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            LinkConfig::from_json(&json)?
        }
        None => LinkConfig::default(),
    };

    match args.command {
        Command::Discover { transport, seconds } => {
            discover(&config, transport, Duration::from_secs(seconds)).await
        }
        Command::Connect { target, transport } => connect(&config, transport, &target).await,
        Command::OtaWifi {
            host,
            firmware,
            password,
        } => ota_wifi(&config, &host, &firmware, password.as_deref()).await,
        Command::OtaBle { firmware } => ota_ble(&config, &firmware).await,
    }
}

async fn discover(config: &LinkConfig, medium: Medium, window: Duration) -> anyhow::Result<()> {
    let mut events = match medium {
        Medium::Tcp => TcpTransport::new(config.tcp.clone()).discover_devices()?,
        Medium::Ble => ble::transport(config).await?.discover_devices()?,
    };

    let deadline = tokio::time::sleep(window);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(DiscoveryEvent::DeviceFound(device)) => {
                    println!("+ {:<32} {} rssi={:?}", device.name, device.identifier, device.rssi);
                }
                Some(DiscoveryEvent::DeviceUpdated(device)) => {
                    info!(name = %device.name, rssi = ?device.rssi, "Updated");
                }
                Some(DiscoveryEvent::DeviceLost(id)) => println!("- {id}"),
                None => break,
            },
            _ = &mut deadline => break,
        }
    }
    Ok(())
}

async fn connect(config: &LinkConfig, medium: Medium, target: &str) -> anyhow::Result<()> {
    match medium {
        Medium::Tcp => {
            let transport = TcpTransport::new(config.tcp.clone());
            let device = transport
                .device_for_manual_connection(target)
                .with_context(|| format!("invalid connection string: {target}"))?;
            let connection = transport.connection_for::<RawFrame, RawFrame>(&device)?;
            pump(connection).await
        }
        Medium::Ble => {
            let transport = ble::transport(config).await?;
            let device = meshlink::Device::new(
                meshlink::transport::ble::peripheral_device_id(target),
                target,
                meshlink::TransportType::Ble,
                target,
            );
            let connection = transport.connection_for::<RawFrame, RawFrame>(&device)?;
            pump(connection).await
        }
    }
}

/// Print events until the link ends or the user interrupts
async fn pump<C>(mut connection: C) -> anyhow::Result<()>
where
    C: Connection<RawFrame, RawFrame>,
{
    let mut events: EventStream<ConnectionEvent<RawFrame>> = connection.connect().await?;
    info!("Connected; press Ctrl-C to disconnect");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(ConnectionEvent::Data(frame)) => println!("<< {}", hex_preview(&frame.0)),
                Some(ConnectionEvent::LogMessage(line)) => println!("log: {}", line.trim_end()),
                Some(terminal) => {
                    info!(should_reconnect = ?terminal.should_reconnect(), "Link ended: {terminal:?}");
                    break;
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                connection.disconnect(None, false).await?;
            }
        }
    }
    Ok(())
}

async fn ota_wifi(
    config: &LinkConfig,
    host: &str,
    firmware: &Path,
    password: Option<&str>,
) -> anyhow::Result<()> {
    let image = std::fs::read(firmware).with_context(|| format!("reading {}", firmware.display()))?;
    let updater = WifiOtaUpdater::new(config.wifi_ota.clone());
    let reporter = tokio::spawn(report(updater.status()));

    let result = updater.run(host, &image, password).await;
    reporter.abort();
    result?;
    println!("Update complete");
    Ok(())
}

#[cfg(feature = "ble")]
async fn ota_ble(config: &LinkConfig, firmware: &Path) -> anyhow::Result<()> {
    let image = std::fs::read(firmware).with_context(|| format!("reading {}", firmware.display()))?;
    let adapter = std::sync::Arc::new(meshlink::BtleplugAdapter::new(config.ble.clone()).await?);
    let updater = meshlink::BleOtaUpdater::new(adapter, config.ble_ota.clone());
    let reporter = tokio::spawn(report(updater.status()));

    let result = updater.run(&image).await;
    reporter.abort();
    result?;
    println!("Update complete");
    Ok(())
}

#[cfg(not(feature = "ble"))]
async fn ota_ble(_config: &LinkConfig, _firmware: &Path) -> anyhow::Result<()> {
    anyhow::bail!("built without Bluetooth support; rebuild with --features ble")
}

async fn report(mut status: watch::Receiver<OtaStatus>) {
    while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        info!(
            state = %current.state,
            progress = %format!("{:.1}%", current.progress),
            "{}",
            current.message
        );
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    const SHOWN: usize = 32;
    let mut out: String = bytes
        .iter()
        .take(SHOWN)
        .map(|b| format!("{b:02x}"))
        .collect();
    if bytes.len() > SHOWN {
        out.push_str(&format!("... ({} bytes)", bytes.len()));
    }
    out
}

#[cfg(feature = "ble")]
mod ble {
    use meshlink::{BleTransport, BtleplugAdapter, LinkConfig};
    use std::sync::Arc;

    pub async fn transport(config: &LinkConfig) -> anyhow::Result<BleTransport> {
        let adapter = BtleplugAdapter::new(config.ble.clone()).await?;
        Ok(BleTransport::new(Arc::new(adapter), config.ble.clone()))
    }
}

#[cfg(not(feature = "ble"))]
mod ble {
    use meshlink::{BleTransport, LinkConfig};

    pub async fn transport(_config: &LinkConfig) -> anyhow::Result<BleTransport> {
        anyhow::bail!("built without Bluetooth support; rebuild with --features ble")
    }
}
