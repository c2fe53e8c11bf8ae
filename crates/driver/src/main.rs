//! xserve-fpd
//!
//! Runs the front panel driver as a hot-plug service, or performs one
//! operation against the first front panel on the bus and exits.

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use common::{create_host_bridge, setup_logging};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use xserve_fp::usb::{self, dispatch_host_events, find_front_panels, spawn_usb_worker};
use xserve_fp::{ChannelSink, Driver, DriverConfig, DriverError, SessionHandle, service};

#[derive(Parser, Debug)]
#[command(name = "xserve-fpd")]
#[command(author, version, about = "Apple Xserve front panel driver")]
#[command(long_about = "
User-space driver for the Apple Xserve front panel (USB 05ac:821b).

EXAMPLES:
    # Run as a service, attaching panels as they appear
    xserve-fpd run

    # Query the status word of the first panel
    xserve-fpd status

    # Drive the actuator
    xserve-fpd set-actuator 127

    # Send raw bytes over bulk OUT
    xserve-fpd write --hex 'de ad be ef'

CONFIGURATION:
    The driver looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/xserve-fp/driver.toml
    3. /etc/xserve-fp/driver.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<std::path::PathBuf>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach front panels as they appear and log their events (default)
    Run,
    /// List front panels on the bus
    List,
    /// Print the status word
    Status,
    /// Set the actuator value
    SetActuator {
        #[arg(allow_negative_numbers = true)]
        value: i32,
    },
    /// Read one bulk packet and print it as hex
    Read {
        /// Maximum number of bytes
        #[arg(long, default_value_t = 64)]
        len: usize,
    },
    /// Write bytes with one bulk transfer
    Write {
        data: String,
        /// Interpret DATA as hex bytes
        #[arg(long)]
        hex: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = DriverConfig::default();
        let path = DriverConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let config = match args.config {
        Some(ref path) => {
            DriverConfig::load(Some(path.clone())).context("Failed to load configuration")?
        }
        None => DriverConfig::load_or_default(),
    };

    let log_level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.driver.log_level);
    setup_logging(log_level).context("Failed to setup logging")?;

    let result = match args.command.unwrap_or(Command::Run) {
        Command::Run => run_service(config).await,
        Command::List => list_panels(),
        command => run_once(config, command).await,
    };

    if let Err(e) = &result
        && let Some(driver_error) = e.downcast_ref::<DriverError>()
    {
        eprintln!("Error: {:#}", e);
        std::process::exit(exit_code(driver_error));
    }
    result
}

#[cfg(unix)]
fn exit_code(error: &DriverError) -> i32 {
    error.errno() as i32
}

#[cfg(not(unix))]
fn exit_code(_error: &DriverError) -> i32 {
    1
}

/// Hot-plug service mode
async fn run_service(config: DriverConfig) -> Result<()> {
    info!("xserve-fp driver v{}", env!("CARGO_PKG_VERSION"));

    let (event_tx, event_rx) = async_channel::bounded(config.monitor.event_backlog.max(1));
    let driver = Arc::new(
        Driver::new(&config).with_event_sink(Arc::new(ChannelSink::new(event_tx))),
    );

    let event_logger = tokio::spawn(async move {
        while let Ok((minor, event)) = event_rx.recv().await {
            info!(
                "Minor {}: event #{} marker={:?} data={}",
                minor,
                event.seq,
                event.marker,
                to_hex(&event.data)
            );
        }
    });

    let (bridge, notifier) = create_host_bridge();
    let worker = spawn_usb_worker(notifier).context("Failed to spawn USB worker thread")?;
    let dispatcher = tokio::spawn(dispatch_host_events(driver.clone(), bridge.clone()));

    if service::is_systemd() {
        info!("Running under systemd");
    }
    service::notify_ready().context("Failed to notify systemd ready")?;
    service::notify_status("Waiting for front panels")
        .context("Failed to send status to systemd")?;

    info!("Press Ctrl+C to shutdown");
    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully..."),
        Err(e) => error!("Error waiting for Ctrl+C: {}", e),
    }

    service::notify_stopping().context("Failed to notify systemd stopping")?;

    bridge.close();
    if let Err(e) = dispatcher.await {
        error!("Host event dispatcher failed: {}", e);
    }
    tokio::task::spawn_blocking(move || worker.shutdown())
        .await
        .context("USB worker shutdown failed")?;

    driver.shutdown().await;
    event_logger.abort();

    info!("Driver shutdown complete");
    Ok(())
}

fn list_panels() -> Result<()> {
    let context = rusb::Context::new().context("Failed to initialize libusb")?;
    let panels = find_front_panels(&context).context("Failed to enumerate USB devices")?;

    if panels.is_empty() {
        println!("No front panels found.");
        return Ok(());
    }

    println!("Found {} front panel(s):\n", panels.len());
    for device in panels {
        let location = usb::device::location_of(&device);
        match usb::device::interface_endpoints(&device) {
            Ok(endpoints) => {
                println!("  Bus {:03} Device {:03}", location.bus, location.address);
                for ep in endpoints {
                    println!(
                        "      endpoint {:#04x} {:?} max packet {}",
                        ep.address,
                        ep.kind,
                        ep.max_packet()
                    );
                }
            }
            Err(e) => println!("  Bus {:03} Device {:03} ({})", location.bus, location.address, e),
        }
    }
    Ok(())
}

/// Attach the first panel, run one operation, detach
async fn run_once(mut config: DriverConfig, command: Command) -> Result<()> {
    config.monitor.enabled = false;
    let driver = Driver::new(&config);

    let request = tokio::task::spawn_blocking(|| -> Result<_> {
        let context = rusb::Context::new().context("Failed to initialize libusb")?;
        let device = find_front_panels(&context)
            .context("Failed to enumerate USB devices")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No front panel found"))?;
        usb::probe(&device).context("Failed to claim front panel")
    })
    .await
    .context("Probe task failed")??;

    let minor = driver.attach(request).await?;
    let handle = driver.open(minor)?;
    let result = execute(&handle, command).await;
    handle.release();
    driver.shutdown().await;
    result
}

async fn execute(handle: &SessionHandle, command: Command) -> Result<()> {
    match command {
        Command::Status => {
            let status = handle.get_status().await?;
            println!("{}", status);
        }
        Command::SetActuator { value } => {
            handle.set_actuator(value).await?;
        }
        Command::Read { len } => {
            let data = handle.read(len).await?;
            println!("{}", to_hex(&data));
        }
        Command::Write { data, hex } => {
            let bytes = if hex {
                parse_hex(&data)?
            } else {
                data.into_bytes()
            };
            let sent = handle.write(&bytes).await?;
            println!("{} of {} bytes written", sent, bytes.len());
        }
        Command::Run | Command::List => bail!("{:?} needs no attached panel", command),
    }
    Ok(())
}

fn to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse hex bytes, ignoring whitespace and an optional `0x` prefix
fn parse_hex(input: &str) -> Result<Vec<u8>> {
    let digits: String = input
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    if !digits.is_ascii() {
        bail!("Invalid hex string '{}'", input);
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in '{}'", input);
    }

    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex() {
        assert_eq!(parse_hex("de ad be ef").unwrap(), vec![0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(parse_hex("0x0102").unwrap(), vec![1, 2]);
        assert!(parse_hex("abc").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x01, 0xab]), "01 ab");
        assert_eq!(to_hex(&[]), "");
    }

    #[test]
    fn test_cli_parses_negative_actuator() {
        let args = Args::try_parse_from(["xserve-fpd", "set-actuator", "-5"]).unwrap();
        assert!(matches!(args.command, Some(Command::SetActuator { value: -5 })));
    }
}
