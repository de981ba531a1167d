//! Terminal configuration management

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use usbh_cdc::{DeviceConfig, DriverConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermConfig {
    pub terminal: TerminalSettings,
    pub device: DeviceSettings,
    /// Dispatch task tuning
    #[serde(default)]
    pub driver: DriverSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TerminalSettings {
    pub log_level: String,
    /// Translate LF typed on stdin into CR LF
    #[serde(default)]
    pub crlf: bool,
}

/// Which device to open and how to buffer it
///
/// # Example Configuration
/// ```toml
/// [device]
/// filter = "0x2e8a:0x000a"  # or "*" for the first compatible device
/// interface = 0
/// rx_buffer_size = 4096
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// "0xVID:0xPID", or "*" for any device
    pub filter: String,
    #[serde(default)]
    pub interface: u8,
    /// Buffer and transfer sizes; 0 keeps the driver default
    #[serde(default)]
    pub rx_buffer_size: usize,
    #[serde(default)]
    pub tx_buffer_size: usize,
    #[serde(default)]
    pub rx_transfers: usize,
    #[serde(default)]
    pub tx_transfers: usize,
    #[serde(default)]
    pub transfer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_stack_size")]
    pub task_stack_size: usize,
    #[serde(default = "DriverSettings::default_event_queue_depth")]
    pub event_queue_depth: usize,
    /// 1..=99, or 0 to inherit the terminal's priority
    #[serde(default)]
    pub task_priority: u8,
    #[serde(default)]
    pub task_core_id: Option<usize>,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            task_stack_size: Self::default_stack_size(),
            event_queue_depth: Self::default_event_queue_depth(),
            task_priority: 0,
            task_core_id: None,
        }
    }
}

impl DriverSettings {
    fn default_stack_size() -> usize {
        usbh_cdc::config::DEFAULT_TASK_STACK_SIZE
    }

    fn default_event_queue_depth() -> usize {
        common::DEFAULT_EVENT_QUEUE_DEPTH
    }
}

impl Default for TermConfig {
    fn default() -> Self {
        Self {
            terminal: TerminalSettings {
                log_level: "info".to_string(),
                crlf: false,
            },
            device: DeviceSettings {
                filter: "*".to_string(),
                interface: 0,
                rx_buffer_size: 0,
                tx_buffer_size: 0,
                rx_transfers: 0,
                tx_transfers: 0,
                transfer_size: 0,
            },
            driver: DriverSettings::default(),
        }
    }
}

impl TermConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usbh-cdc/term.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: TermConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::debug!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usbh-cdc").join("term.toml")
        } else {
            PathBuf::from(".config/usbh-cdc/term.toml")
        }
    }

    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.terminal.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.terminal.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_filter(&self.device.filter)?;
        self.device_config()
            .validate()
            .context("Invalid [device] settings")?;
        self.driver_config()
            .validate()
            .context("Invalid [driver] settings")?;
        Ok(())
    }

    /// Driver settings for installing the driver
    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            task_stack_size: self.driver.task_stack_size,
            event_queue_depth: self.driver.event_queue_depth,
            task_priority: self.driver.task_priority,
            task_core_id: self.driver.task_core_id,
            ..Default::default()
        }
    }

    /// Device settings without callbacks
    pub fn device_config(&self) -> DeviceConfig {
        let (vendor_id, product_id) = parse_filter(&self.device.filter).unwrap_or((0, 0));
        DeviceConfig::new(vendor_id, product_id, self.device.interface)
            .with_buffer_sizes(self.device.rx_buffer_size, self.device.tx_buffer_size)
            .with_transfers(self.device.rx_transfers, self.device.tx_transfers)
            .with_transfer_size(self.device.transfer_size)
    }
}

/// Parse a device filter into (vendor id, product id); "*" gives (0, 0)
///
/// Vendor and product are matched together, so "0x1234:*" is refused.
pub fn parse_filter(filter: &str) -> Result<(u16, u16)> {
    if filter == "*" || filter == "*:*" {
        return Ok((0, 0));
    }

    let parts: Vec<&str> = filter.split(':').collect();
    if parts.len() != 2 {
        return Err(anyhow!(
            "Invalid filter format '{}', expected VID:PID (e.g., '0x1234:0x5678') or '*'",
            filter
        ));
    }
    if parts.contains(&"*") {
        return Err(anyhow!(
            "Invalid filter '{}', vendor and product must both be given or both be '*'",
            filter
        ));
    }

    let vid = parse_hex_id(parts[0], "VID")?;
    let pid = parse_hex_id(parts[1], "PID")?;
    if vid == 0 || pid == 0 {
        return Err(anyhow!("Invalid filter '{}', 0x0000 is reserved for '*'", filter));
    }
    Ok((vid, pid))
}

fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}

/// Expand `~` in a user supplied path
pub fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = TermConfig::default();
        assert_eq!(config.terminal.log_level, "info");
        assert_eq!(config.device.filter, "*");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_filter_valid() {
        assert_eq!(parse_filter("*").unwrap(), (0, 0));
        assert_eq!(parse_filter("*:*").unwrap(), (0, 0));
        assert_eq!(parse_filter("0x1234:0x5678").unwrap(), (0x1234, 0x5678));
        assert_eq!(parse_filter("0XABCD:0xef01").unwrap(), (0xABCD, 0xEF01));
    }

    #[test]
    fn test_parse_filter_invalid() {
        assert!(parse_filter("1234:5678").is_err());
        assert!(parse_filter("0x1234").is_err());
        assert!(parse_filter("0x1234:0x5678:0x9abc").is_err());
        assert!(parse_filter("0xGHIJ:0x5678").is_err());
        assert!(parse_filter("0x12345:0x5678").is_err());
        assert!(parse_filter("0x1234:*").is_err());
        assert!(parse_filter("0x0000:0x5678").is_err());
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = TermConfig::default();
        config.terminal.log_level = "invalid".to_string();
        assert!(config.validate().is_err());

        config.terminal.log_level = "debug".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_small_buffer() {
        let mut config = TermConfig::default();
        config.device.rx_buffer_size = 8;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_config_from_settings() {
        let mut config = TermConfig::default();
        config.device.filter = "0x2e8a:0x000a".to_string();
        config.device.interface = 2;
        config.device.rx_buffer_size = 4096;

        let device = config.device_config();
        assert_eq!(device.vendor_id, 0x2e8a);
        assert_eq!(device.product_id, 0x000a);
        assert_eq!(device.interface, 2);
        assert_eq!(device.rx_buffer_size, 4096);
        assert_eq!(device.tx_buffer_size, 0);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("term.toml");

        let mut config = TermConfig::default();
        config.device.filter = "0x1234:0x5678".to_string();
        config.terminal.crlf = true;
        config.save(&path).unwrap();

        let loaded = TermConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.device.filter, "0x1234:0x5678");
        assert!(loaded.terminal.crlf);
        assert_eq!(
            loaded.driver.event_queue_depth,
            common::DEFAULT_EVENT_QUEUE_DEPTH
        );
    }

    #[test]
    fn test_load_fills_optional_sections() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("term.toml");
        fs::write(
            &path,
            "[terminal]\nlog_level = \"warn\"\n\n[device]\nfilter = \"*\"\n",
        )
        .unwrap();

        let loaded = TermConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.terminal.log_level, "warn");
        assert!(!loaded.terminal.crlf);
        assert_eq!(loaded.device.interface, 0);
        assert_eq!(
            loaded.driver.task_stack_size,
            usbh_cdc::config::DEFAULT_TASK_STACK_SIZE
        );
    }

    #[test]
    fn test_load_rejects_bad_filter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("term.toml");
        fs::write(
            &path,
            "[terminal]\nlog_level = \"info\"\n\n[device]\nfilter = \"1234:5678\"\n",
        )
        .unwrap();

        assert!(TermConfig::load(Some(path)).is_err());
    }

    #[test]
    fn test_expand_path_keeps_absolute() {
        assert_eq!(expand_path("/etc/usbh-cdc/term.toml"), PathBuf::from("/etc/usbh-cdc/term.toml"));
    }
}
