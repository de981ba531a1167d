//! Per-device state shared between the application and the dispatch task
//!
//! A [`Device`] is created by [`CdcDriver::create`](crate::CdcDriver::create)
//! and lives in the registry until it is deleted. Application threads reach it
//! through a cloned `Arc` to move bytes through its pipes; the dispatch task
//! drives its state machine.

use crate::config::DeviceConfig;
use crate::error::Result;
use crate::pipe::Pipe;
use common::DeviceArrival;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Opaque application-side reference to a device
///
/// Handles carry a generation so that a handle to a deleted device is
/// rejected even after its registry slot has been reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

/// Lifecycle of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceState {
    /// Registered, waiting for a matching physical device
    Created = 0,
    /// Interface claim in progress
    Opening = 1,
    /// Interface claimed, transfers running
    Connected = 2,
    /// Physical device removed or link failed; only delete remains
    Disconnected = 3,
    /// Delete in progress, waiting for transfers to drain
    Closing = 4,
}

impl DeviceState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DeviceState::Created,
            1 => DeviceState::Opening,
            2 => DeviceState::Connected,
            3 => DeviceState::Disconnected,
            _ => DeviceState::Closing,
        }
    }
}

/// Coarse link state reported to applications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Error,
    Disconnected,
    Connected,
}

impl From<DeviceState> for LinkState {
    fn from(state: DeviceState) -> Self {
        match state {
            DeviceState::Connected => LinkState::Connected,
            DeviceState::Created | DeviceState::Opening | DeviceState::Disconnected => {
                LinkState::Disconnected
            }
            DeviceState::Closing => LinkState::Error,
        }
    }
}

/// What a device matches against; 0/0 vendor and product is a wildcard
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: u8,
}

impl DeviceIdentity {
    pub fn is_wildcard(&self) -> bool {
        self.vendor_id == 0 && self.product_id == 0
    }

    pub fn matches(&self, arrival: &DeviceArrival) -> bool {
        self.is_wildcard()
            || (self.vendor_id == arrival.vendor_id && self.product_id == arrival.product_id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_wildcard() {
            write!(f, "*:*/{}", self.interface)
        } else {
            write!(
                f,
                "{:04x}:{:04x}/{}",
                self.vendor_id, self.product_id, self.interface
            )
        }
    }
}

/// Opaque token handed back to every callback of a device
pub type UserData = Arc<dyn Any + Send + Sync>;

/// Device event callback, run on the dispatch task
pub type EventCallback = Arc<dyn Fn(DeviceHandle, Option<&UserData>) + Send + Sync>;

/// Application callbacks for one device
#[derive(Clone, Default)]
pub struct EventCallbacks {
    pub connect: Option<EventCallback>,
    pub disconnect: Option<EventCallback>,
    pub recv_data: Option<EventCallback>,
    pub user_data: Option<UserData>,
}

impl EventCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connect<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceHandle, Option<&UserData>) + Send + Sync + 'static,
    {
        self.connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceHandle, Option<&UserData>) + Send + Sync + 'static,
    {
        self.disconnect = Some(Arc::new(f));
        self
    }

    /// Called after bytes were pushed into the RX pipe
    pub fn on_recv_data<F>(mut self, f: F) -> Self
    where
        F: Fn(DeviceHandle, Option<&UserData>) + Send + Sync + 'static,
    {
        self.recv_data = Some(Arc::new(f));
        self
    }

    pub fn with_user_data(mut self, data: UserData) -> Self {
        self.user_data = Some(data);
        self
    }
}

impl fmt::Debug for EventCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventCallbacks")
            .field("connect", &self.connect.is_some())
            .field("disconnect", &self.disconnect.is_some())
            .field("recv_data", &self.recv_data.is_some())
            .field("user_data", &self.user_data.is_some())
            .finish()
    }
}

/// Which callback to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DeviceEvent {
    Connected,
    Disconnected,
    DataReceived,
}

/// Transfer slot settings resolved from a [`DeviceConfig`]
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlotConfig {
    pub rx_transfers: usize,
    pub tx_transfers: usize,
    pub transfer_size: usize,
}

pub(crate) struct Device {
    pub handle: DeviceHandle,
    pub identity: DeviceIdentity,
    state: AtomicU8,
    pub rx: Pipe,
    pub tx: Pipe,
    pub callbacks: EventCallbacks,
    pub slots: SlotConfig,
    /// Set while a Service command for this device is queued
    service_pending: AtomicBool,
    info: Mutex<Option<DeviceArrival>>,
}

impl Device {
    /// Allocate a device and both of its pipes
    pub fn new(handle: DeviceHandle, config: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            handle,
            identity: config.identity(),
            state: AtomicU8::new(DeviceState::Created as u8),
            rx: Pipe::new(config.rx_buffer_size)?,
            tx: Pipe::new(config.tx_buffer_size)?,
            callbacks: config.callbacks.clone(),
            slots: SlotConfig {
                rx_transfers: config.rx_slot_count(),
                tx_transfers: config.tx_slot_count(),
                transfer_size: config.effective_transfer_size(),
            },
            service_pending: AtomicBool::new(false),
            info: Mutex::new(None),
        })
    }

    pub fn state(&self) -> DeviceState {
        DeviceState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: DeviceState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Move from `from` to `to`; fails if another transition happened first
    pub fn transition(&self, from: DeviceState, to: DeviceState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == DeviceState::Connected
    }

    /// Mark a Service command as queued; true if none was queued before
    pub fn request_service(&self) -> bool {
        !self.service_pending.swap(true, Ordering::AcqRel)
    }

    pub fn clear_service_request(&self) {
        self.service_pending.store(false, Ordering::Release);
    }

    pub fn info(&self) -> Option<DeviceArrival> {
        self.info.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn set_info(&self, info: Option<DeviceArrival>) {
        *self.info.lock().unwrap_or_else(|e| e.into_inner()) = info;
    }

    /// Run the application callback for `event`
    ///
    /// A panicking callback is logged and otherwise ignored.
    pub fn fire(&self, event: DeviceEvent) {
        let callback = match event {
            DeviceEvent::Connected => &self.callbacks.connect,
            DeviceEvent::Disconnected => &self.callbacks.disconnect,
            DeviceEvent::DataReceived => &self.callbacks.recv_data,
        };
        let Some(callback) = callback else {
            return;
        };

        let handle = self.handle;
        let user_data = self.callbacks.user_data.as_ref();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            callback(handle, user_data)
        }));
        if result.is_err() {
            tracing::error!("Panic in {:?} callback of device {}", event, handle);
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("handle", &self.handle)
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("rx", &self.rx)
            .field("tx", &self.tx)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn handle(index: u32) -> DeviceHandle {
        DeviceHandle {
            index,
            generation: 1,
        }
    }

    #[test]
    fn test_state_transition() {
        let device = Device::new(handle(0), &DeviceConfig::default()).unwrap();
        assert_eq!(device.state(), DeviceState::Created);

        assert!(device.transition(DeviceState::Created, DeviceState::Opening));
        assert!(!device.transition(DeviceState::Created, DeviceState::Opening));
        assert_eq!(device.state(), DeviceState::Opening);
    }

    #[test]
    fn test_link_state_mapping() {
        assert_eq!(LinkState::from(DeviceState::Connected), LinkState::Connected);
        assert_eq!(
            LinkState::from(DeviceState::Created),
            LinkState::Disconnected
        );
        assert_eq!(LinkState::from(DeviceState::Closing), LinkState::Error);
    }

    #[test]
    fn test_identity_matching() {
        let arrival = common::test_utils::create_mock_vendor_arrival(
            common::DeviceAddress::new(1, 2),
            0x1234,
            0x5678,
        );

        let wildcard = DeviceIdentity {
            vendor_id: 0,
            product_id: 0,
            interface: 0,
        };
        let exact = DeviceIdentity {
            vendor_id: 0x1234,
            product_id: 0x5678,
            interface: 0,
        };
        let other = DeviceIdentity {
            vendor_id: 0x1234,
            product_id: 0x9999,
            interface: 0,
        };

        assert!(wildcard.matches(&arrival));
        assert!(exact.matches(&arrival));
        assert!(!other.matches(&arrival));
        assert_eq!(exact.to_string(), "1234:5678/0");
    }

    #[test]
    fn test_service_request_coalesces() {
        let device = Device::new(handle(1), &DeviceConfig::default()).unwrap();
        assert!(device.request_service());
        assert!(!device.request_service());
        device.clear_service_request();
        assert!(device.request_service());
    }

    #[test]
    fn test_fire_passes_user_data() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let callbacks = EventCallbacks::new()
            .on_connect(move |_, data| {
                let value = data
                    .and_then(|d| d.downcast_ref::<usize>())
                    .copied()
                    .unwrap_or(0);
                counter.fetch_add(value, Ordering::SeqCst);
            })
            .with_user_data(Arc::new(7usize));
        let config = DeviceConfig::default().with_callbacks(callbacks);

        let device = Device::new(handle(2), &config).unwrap();
        device.fire(DeviceEvent::Connected);
        device.fire(DeviceEvent::Disconnected);

        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_fire_survives_panic() {
        let callbacks = EventCallbacks::new().on_recv_data(|_, _| panic!("callback failure"));
        let config = DeviceConfig::default().with_callbacks(callbacks);

        let device = Device::new(handle(3), &config).unwrap();
        device.fire(DeviceEvent::DataReceived);
    }
}
