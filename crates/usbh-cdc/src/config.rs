//! Driver and device configuration
//!
//! Zero values select defaults so that `..Default::default()` and partially
//! filled configurations both work. `validate` only rejects values the driver
//! cannot honour.

use crate::device::{DeviceIdentity, EventCallbacks};
use crate::error::{Error, Result};
use crate::pipe::MIN_BUFFER_SIZE;
use common::{DEFAULT_EVENT_QUEUE_DEPTH, DeviceArrival};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Smallest stack the dispatch thread may be given
pub const MIN_TASK_STACK_SIZE: usize = 16 * 1024;

pub const DEFAULT_TASK_STACK_SIZE: usize = 256 * 1024;

pub const DEFAULT_TASK_NAME: &str = "usbh-cdc";

/// Upper bound on transfer slots per direction
pub const MAX_TRANSFERS: usize = 4;

pub const DEFAULT_RX_TRANSFERS: usize = 2;
pub const DEFAULT_TX_TRANSFERS: usize = 1;

/// Bytes moved by one transfer unless configured otherwise
pub const DEFAULT_TRANSFER_SIZE: usize = 512;

/// Called on the dispatch task for every physical device that arrives
///
/// The descriptor snapshot is lent for the duration of the call; the device
/// cannot be opened from here.
pub type NewDeviceCallback = Arc<dyn Fn(&DeviceArrival) + Send + Sync>;

/// Settings for [`CdcDriver::install`](crate::CdcDriver::install)
#[derive(Clone)]
pub struct DriverConfig {
    /// Name of the dispatch thread
    pub task_name: String,
    pub task_stack_size: usize,
    /// Cross-platform priority 1..=99 for the dispatch thread; 0 inherits
    pub task_priority: u8,
    /// Pin the dispatch thread to this core
    pub task_core_id: Option<usize>,
    /// The host layer is already installed by someone else
    pub skip_host_init: bool,
    pub event_queue_depth: usize,
    /// How long install waits for the dispatch task to come up
    pub startup_timeout: Duration,
    /// How long uninstall waits for the dispatch task to exit
    pub uninstall_timeout: Duration,
    pub new_device_callback: Option<NewDeviceCallback>,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            task_name: DEFAULT_TASK_NAME.to_string(),
            task_stack_size: DEFAULT_TASK_STACK_SIZE,
            task_priority: 0,
            task_core_id: None,
            skip_host_init: false,
            event_queue_depth: DEFAULT_EVENT_QUEUE_DEPTH,
            startup_timeout: Duration::from_secs(1),
            uninstall_timeout: Duration::from_secs(1),
            new_device_callback: None,
        }
    }
}

impl DriverConfig {
    pub fn with_new_device_callback<F>(mut self, f: F) -> Self
    where
        F: Fn(&DeviceArrival) + Send + Sync + 'static,
    {
        self.new_device_callback = Some(Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.task_name.is_empty() {
            return Err(Error::InvalidArgument("task name is empty".to_string()));
        }
        if self.task_stack_size < MIN_TASK_STACK_SIZE {
            return Err(Error::InvalidArgument(format!(
                "task stack size {} is below the minimum of {}",
                self.task_stack_size, MIN_TASK_STACK_SIZE
            )));
        }
        if self.event_queue_depth == 0 {
            return Err(Error::InvalidArgument(
                "event queue depth must be at least 1".to_string(),
            ));
        }
        if self.startup_timeout.is_zero() || self.uninstall_timeout.is_zero() {
            return Err(Error::InvalidArgument(
                "startup and uninstall timeouts must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for DriverConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverConfig")
            .field("task_name", &self.task_name)
            .field("task_stack_size", &self.task_stack_size)
            .field("task_priority", &self.task_priority)
            .field("task_core_id", &self.task_core_id)
            .field("skip_host_init", &self.skip_host_init)
            .field("event_queue_depth", &self.event_queue_depth)
            .field("startup_timeout", &self.startup_timeout)
            .field("uninstall_timeout", &self.uninstall_timeout)
            .field("new_device_callback", &self.new_device_callback.is_some())
            .finish()
    }
}

/// Settings for [`CdcDriver::create`](crate::CdcDriver::create)
#[derive(Debug, Clone, Default)]
pub struct DeviceConfig {
    /// 0 together with `product_id == 0` matches any device
    pub vendor_id: u16,
    pub product_id: u16,
    /// Data interface, or the CDC communications interface paired with it
    pub interface: u8,
    /// 0 selects 1024 bytes
    pub rx_buffer_size: usize,
    /// 0 selects 1024 bytes
    pub tx_buffer_size: usize,
    /// IN transfers kept in flight, 0 selects 2
    pub rx_transfers: usize,
    /// OUT transfers kept in flight, 0 selects 1
    pub tx_transfers: usize,
    /// Largest single transfer, 0 selects 512 bytes
    pub transfer_size: usize,
    pub callbacks: EventCallbacks,
}

impl DeviceConfig {
    /// Match a specific device
    pub fn new(vendor_id: u16, product_id: u16, interface: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            interface,
            ..Default::default()
        }
    }

    /// Match the first compatible device
    pub fn any(interface: u8) -> Self {
        Self::new(0, 0, interface)
    }

    pub fn with_buffer_sizes(mut self, rx: usize, tx: usize) -> Self {
        self.rx_buffer_size = rx;
        self.tx_buffer_size = tx;
        self
    }

    pub fn with_transfers(mut self, rx: usize, tx: usize) -> Self {
        self.rx_transfers = rx;
        self.tx_transfers = tx;
        self
    }

    pub fn with_transfer_size(mut self, size: usize) -> Self {
        self.transfer_size = size;
        self
    }

    pub fn with_callbacks(mut self, callbacks: EventCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            vendor_id: self.vendor_id,
            product_id: self.product_id,
            interface: self.interface,
        }
    }

    pub(crate) fn rx_slot_count(&self) -> usize {
        or_default(self.rx_transfers, DEFAULT_RX_TRANSFERS)
    }

    pub(crate) fn tx_slot_count(&self) -> usize {
        or_default(self.tx_transfers, DEFAULT_TX_TRANSFERS)
    }

    pub(crate) fn effective_transfer_size(&self) -> usize {
        or_default(self.transfer_size, DEFAULT_TRANSFER_SIZE)
    }

    pub fn validate(&self) -> Result<()> {
        if (self.vendor_id == 0) != (self.product_id == 0) {
            return Err(Error::InvalidArgument(format!(
                "vendor and product id must both be set or both be 0 (got {:04x}:{:04x})",
                self.vendor_id, self.product_id
            )));
        }

        for (name, size) in [("rx", self.rx_buffer_size), ("tx", self.tx_buffer_size)] {
            if size != 0 && size < MIN_BUFFER_SIZE {
                return Err(Error::InvalidArgument(format!(
                    "{} buffer size {} is below the minimum of {}",
                    name, size, MIN_BUFFER_SIZE
                )));
            }
        }

        for (name, count) in [("rx", self.rx_transfers), ("tx", self.tx_transfers)] {
            if count > MAX_TRANSFERS {
                return Err(Error::InvalidArgument(format!(
                    "{} transfer count {} exceeds {}",
                    name, count, MAX_TRANSFERS
                )));
            }
        }

        if self.transfer_size != 0 && self.transfer_size < MIN_BUFFER_SIZE {
            return Err(Error::InvalidArgument(format!(
                "transfer size {} is below the minimum of {}",
                self.transfer_size, MIN_BUFFER_SIZE
            )));
        }

        Ok(())
    }
}

fn or_default(value: usize, default: usize) -> usize {
    if value == 0 { default } else { value }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::pipe::DEFAULT_BUFFER_SIZE;

    #[test]
    fn test_default_driver_config_is_valid() {
        let config = DriverConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.task_name, "usbh-cdc");
    }

    #[test]
    fn test_driver_config_rejects_small_stack() {
        let config = DriverConfig {
            task_stack_size: 1024,
            ..Default::default()
        };
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_driver_config_rejects_zero_queue() {
        let config = DriverConfig {
            event_queue_depth: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_device_config_defaults() {
        let config = DeviceConfig::any(0);
        assert!(config.validate().is_ok());
        assert_eq!(config.rx_slot_count(), 2);
        assert_eq!(config.tx_slot_count(), 1);
        assert_eq!(config.effective_transfer_size(), 512);
        assert_eq!(config.rx_buffer_size, 0);
        assert_eq!(DEFAULT_BUFFER_SIZE, 1024);
    }

    #[test]
    fn test_device_config_half_wildcard() {
        let config = DeviceConfig::new(0x1234, 0, 0);
        assert_eq!(
            config.validate().unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_device_config_limits() {
        assert!(DeviceConfig::any(0).with_transfers(5, 1).validate().is_err());
        assert!(DeviceConfig::any(0).with_transfers(4, 4).validate().is_ok());
        assert!(
            DeviceConfig::any(0)
                .with_buffer_sizes(32, 0)
                .validate()
                .is_err()
        );
        assert!(DeviceConfig::any(0).with_transfer_size(16).validate().is_err());
    }
}
