//! usbh-cdc terminal
//!
//! Connects stdin and stdout to the byte stream of a USB serial device through
//! the usbh-cdc driver.

mod config;

use anyhow::{Context, Result};
use clap::Parser;
use common::setup_logging;
use config::TermConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use usbh_cdc::{CdcDriver, DeviceHandle, ErrorKind, EventCallbacks, RusbHost};

/// Wait before retrying a write into a full TX pipe
const WRITE_RETRY_INTERVAL: Duration = Duration::from_millis(5);

const READ_CHUNK: usize = 512;

#[derive(Parser, Debug)]
#[command(name = "usbh-cdc-term")]
#[command(author, version, about = "Serial terminal for USB CDC devices")]
#[command(long_about = "
A minimal serial terminal on top of the usbh-cdc host driver. Bytes typed on
stdin are sent to the device; bytes received from the device go to stdout.

EXAMPLES:
    # First compatible device, interface 0
    usbh-cdc-term

    # A specific device
    usbh-cdc-term --device 0x2e8a:0x000a

    # List attached USB devices
    usbh-cdc-term --list

CONFIGURATION:
    The terminal looks for configuration files in the following order:
    1. Path specified with --config
    2. ~/.config/usbh-cdc/term.toml
    3. /etc/usbh-cdc/term.toml
    4. Built-in defaults
")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<String>,

    /// Save default configuration to default location and exit
    #[arg(long)]
    save_config: bool,

    /// Device filter, "0xVID:0xPID" or "*"
    #[arg(short, long, value_name = "FILTER")]
    device: Option<String>,

    /// Interface number of the data (or CDC communications) interface
    #[arg(short, long, value_name = "N")]
    interface: Option<u8>,

    /// List USB devices and exit
    #[arg(long)]
    list: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, value_name = "LEVEL")]
    log_level: Option<String>,
}

/// Device notifications forwarded from driver callbacks
#[derive(Debug, Clone, Copy)]
enum TermEvent {
    Connected,
    Disconnected,
    Data,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.save_config {
        let config = TermConfig::default();
        let path = TermConfig::default_path();
        config.save(&path).context("Failed to save configuration")?;
        println!("Configuration saved to: {}", path.display());
        return Ok(());
    }

    let mut config = if let Some(ref path) = args.config {
        TermConfig::load(Some(config::expand_path(path))).context("Failed to load configuration")?
    } else {
        TermConfig::load_or_default()
    };

    if let Some(filter) = args.device {
        config.device.filter = filter;
    }
    if let Some(interface) = args.interface {
        config.device.interface = interface;
    }
    if let Some(level) = args.log_level {
        config.terminal.log_level = level;
    }
    config.validate().context("Invalid configuration")?;

    // Logs go to stderr; stdout carries the device stream
    setup_logging(&config.terminal.log_level).context("Failed to setup logging")?;
    info!("usbh-cdc-term v{}", env!("CARGO_PKG_VERSION"));

    let host = RusbHost::new().context("Failed to initialize libusb")?;

    if args.list {
        return list_devices(&host);
    }

    let result = run_terminal(config, host).await;
    if result.is_ok() {
        // The blocking stdin read cannot be cancelled and would hold the runtime open
        std::process::exit(0);
    }
    result
}

/// List USB devices and exit
fn list_devices(host: &RusbHost) -> Result<()> {
    let devices = host.list_devices().context("Failed to enumerate USB devices")?;

    if devices.is_empty() {
        println!("No USB devices found.");
        return Ok(());
    }

    println!("Found {} USB device(s):\n", devices.len());
    for device in devices {
        println!(
            "  {} {:04x}:{:04x} class {:02x}",
            device.address, device.vendor_id, device.product_id, device.class
        );
        for itf in &device.interfaces {
            let stream = if itf.data_endpoints().is_some() {
                " (byte stream)"
            } else {
                ""
            };
            println!(
                "      interface {} class {:02x}/{:02x}/{:02x}{}",
                itf.number, itf.class, itf.subclass, itf.protocol, stream
            );
        }
        println!();
    }
    Ok(())
}

async fn run_terminal(config: TermConfig, host: RusbHost) -> Result<()> {
    let driver = Arc::new(CdcDriver::new());
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();

    let install = {
        let driver = driver.clone();
        let driver_config = config.driver_config();
        tokio::task::spawn_blocking(move || driver.install(driver_config, Arc::new(host)))
    };
    install
        .await
        .context("Driver install task failed")?
        .context("Failed to install driver")?;

    let device_config = config
        .device_config()
        .with_callbacks(forward_events(events_tx));
    let handle = match driver.create(device_config) {
        Ok(handle) => handle,
        Err(e) => {
            shutdown(driver, None).await?;
            return Err(e).context("Failed to create device");
        }
    };
    info!(
        "Waiting for device {} on interface {} (Ctrl-C to quit)",
        config.device.filter, config.device.interface
    );

    let result = pump(&driver, handle, config.terminal.crlf, &mut events_rx).await;
    shutdown(driver, Some(handle)).await?;
    result
}

fn forward_events(events: mpsc::UnboundedSender<TermEvent>) -> EventCallbacks {
    let (connect, disconnect, data) = (events.clone(), events.clone(), events);
    EventCallbacks::new()
        .on_connect(move |_, _| {
            let _ = connect.send(TermEvent::Connected);
        })
        .on_disconnect(move |_, _| {
            let _ = disconnect.send(TermEvent::Disconnected);
        })
        .on_recv_data(move |_, _| {
            let _ = data.send(TermEvent::Data);
        })
}

/// Move bytes between stdin/stdout and the device until Ctrl-C
async fn pump(
    driver: &CdcDriver,
    handle: DeviceHandle,
    crlf: bool,
    events: &mut mpsc::UnboundedReceiver<TermEvent>,
) -> Result<()> {
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(16);
    tokio::spawn(read_stdin(input_tx));

    let mut stdout = tokio::io::stdout();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                return Ok(());
            }

            Some(event) = events.recv() => match event {
                TermEvent::Connected => {
                    if let Ok(Some(info)) = driver.device_info(handle) {
                        info!(
                            "Connected to {} {:04x}:{:04x}",
                            info.address, info.vendor_id, info.product_id
                        );
                    }
                }
                TermEvent::Disconnected => {
                    warn!("Device disconnected; restart to reconnect");
                }
                TermEvent::Data => drain_rx(driver, handle, &mut stdout).await?,
            },

            input = input_rx.recv(), if stdin_open => match input {
                Some(data) => {
                    let data = if crlf { to_crlf(&data) } else { data };
                    send_all(driver, handle, &data).await?;
                }
                None => {
                    debug!("stdin closed");
                    stdin_open = false;
                }
            },
        }
    }
}

async fn read_stdin(input: mpsc::Sender<Vec<u8>>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if input.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!("Failed to read stdin: {}", e);
                break;
            }
        }
    }
}

/// Copy every buffered RX byte to stdout
async fn drain_rx(
    driver: &CdcDriver,
    handle: DeviceHandle,
    stdout: &mut tokio::io::Stdout,
) -> Result<()> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        let n = match driver.read_bytes(handle, &mut buf) {
            Ok(n) => n,
            // Disconnected after the notification was queued
            Err(e) if e.kind() == ErrorKind::InvalidState => 0,
            Err(e) => return Err(e).context("Failed to read from device"),
        };
        if n == 0 {
            break;
        }
        stdout
            .write_all(&buf[..n])
            .await
            .context("Failed to write to stdout")?;
    }
    stdout.flush().await.context("Failed to flush stdout")?;
    Ok(())
}

/// Write all of `data`, waiting for TX space as needed
async fn send_all(driver: &CdcDriver, handle: DeviceHandle, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        match driver.write_bytes(handle, data) {
            Ok(0) => tokio::time::sleep(WRITE_RETRY_INTERVAL).await,
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::InvalidState => {
                warn!("Device not connected, dropping {} bytes", data.len());
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to write to device"),
        }
    }
    Ok(())
}

fn to_crlf(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 8);
    for &byte in data {
        if byte == b'\n' {
            out.push(b'\r');
        }
        out.push(byte);
    }
    out
}

/// Delete the device and uninstall the driver off the async runtime
async fn shutdown(driver: Arc<CdcDriver>, handle: Option<DeviceHandle>) -> Result<()> {
    tokio::task::spawn_blocking(move || -> Result<()> {
        if let Some(handle) = handle {
            driver.delete(handle).context("Failed to delete device")?;
        }
        driver.uninstall().context("Failed to uninstall driver")?;
        Ok(())
    })
    .await
    .context("Driver shutdown task failed")??;
    info!("Driver stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_crlf() {
        assert_eq!(to_crlf(b"AT\n"), b"AT\r\n");
        assert_eq!(to_crlf(b"a\nb\n"), b"a\r\nb\r\n");
        assert_eq!(to_crlf(b"plain"), b"plain");
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from([
            "usbh-cdc-term",
            "--device",
            "0x1234:0x5678",
            "--interface",
            "2",
            "-l",
            "debug",
        ]);
        assert_eq!(args.device.as_deref(), Some("0x1234:0x5678"));
        assert_eq!(args.interface, Some(2));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(!args.list);
    }
}
