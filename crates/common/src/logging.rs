//! Logging setup and configuration
//!
//! Logs go to stderr so that a terminal front-end can use stdout for the
//! device byte stream.

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Crates whose events follow the requested level; everything else logs warnings only
const OWN_CRATES: [&str; 3] = ["usbh_cdc", "cdc_term", "common"];

/// Filter directive enabling `level` for our crates
pub fn default_directive(level: &str) -> String {
    OWN_CRATES
        .iter()
        .fold("warn".to_string(), |acc, krate| format!("{acc},{krate}={level}"))
}

/// Setup tracing subscriber for the application
///
/// `RUST_LOG` takes precedence over `default_level` when set.
pub fn setup_logging(default_level: &str) -> crate::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive(default_level)))
        .map_err(|e| crate::Error::Config(format!("Invalid log filter: {}", e)))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .map_err(|e| crate::Error::Config(format!("Logging already initialized: {}", e)))?;

    Ok(())
}
