//! libusb host manager
//!
//! Owns the libusb context, the event pump thread and the hot-plug
//! registration, and tracks the devices currently attached so that the
//! driver can open them by address.

use crate::usb::device::{CLASS_HUB, RusbLink, device_address, snapshot};
use common::{
    DeviceAddress, DeviceArrival, HostError, HostEvent, HostEventSender, InterfaceLink, UsbHost,
};
use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Timeout of one `handle_events` call on the pump thread
const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

type DeviceMap = Arc<Mutex<HashMap<DeviceAddress, Device<Context>>>>;

struct EventPump {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

#[derive(Default)]
struct HostState {
    pump: Option<EventPump>,
    registration: Option<Registration<Context>>,
    events: Option<HostEventSender>,
}

/// [`UsbHost`] backed by libusb
pub struct RusbHost {
    context: Context,
    devices: DeviceMap,
    state: Mutex<HostState>,
}

impl RusbHost {
    pub fn new() -> Result<Self, rusb::Error> {
        Ok(Self {
            context: Context::new()?,
            devices: Arc::new(Mutex::new(HashMap::new())),
            state: Mutex::new(HostState::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Descriptor snapshots of every device currently attached
    ///
    /// Works without installing or registering; hubs are skipped.
    pub fn list_devices(&self) -> Result<Vec<DeviceArrival>, rusb::Error> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            if is_hub(&device) {
                continue;
            }
            match snapshot(&device) {
                Ok(arrival) => found.push(arrival),
                Err(e) => debug!("Skipping device {}: {}", device_address(&device), e),
            }
        }
        Ok(found)
    }

    /// Report every attached device once (no hot-plug support)
    fn enumerate(&self, events: &HostEventSender) -> Result<(), rusb::Error> {
        let devices = self.context.devices()?;
        let mut tracker = HotplugCallback {
            devices: self.devices.clone(),
            events: events.clone(),
        };
        for device in devices.iter() {
            tracker.device_arrived(device);
        }
        Ok(())
    }
}

fn is_hub(device: &Device<Context>) -> bool {
    device
        .device_descriptor()
        .map(|d| d.class_code() == CLASS_HUB)
        .unwrap_or(false)
}

impl UsbHost for RusbHost {
    fn install(&self) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.pump.is_some() {
            return Ok(());
        }

        let stop = Arc::new(AtomicBool::new(false));
        let context = self.context.clone();
        let flag = stop.clone();
        let join = std::thread::Builder::new()
            .name("usb-host-events".to_string())
            .spawn(move || {
                debug!("USB event pump started");
                while !flag.load(Ordering::Acquire) {
                    match context.handle_events(Some(EVENT_POLL_TIMEOUT)) {
                        Ok(()) => {}
                        Err(rusb::Error::Interrupted) => {
                            debug!("USB event handling interrupted");
                        }
                        Err(e) => {
                            warn!("Error handling USB events: {}", e);
                            std::thread::sleep(EVENT_POLL_TIMEOUT);
                        }
                    }
                }
                debug!("USB event pump stopped");
            })
            .map_err(|e| HostError::Other(format!("failed to spawn event pump: {}", e)))?;

        state.pump = Some(EventPump { stop, join });
        info!("libusb host installed");
        Ok(())
    }

    fn uninstall(&self) -> Result<(), HostError> {
        let pump = self.lock().pump.take().ok_or(HostError::NotInstalled)?;
        pump.stop.store(true, Ordering::Release);
        if pump.join.join().is_err() {
            error!("USB event pump panicked");
        }
        info!("libusb host uninstalled");
        Ok(())
    }

    fn register_client(&self, events: HostEventSender) -> Result<(), HostError> {
        let mut state = self.lock();
        if state.events.is_some() {
            return Err(HostError::ClientRegistered);
        }

        if rusb::has_hotplug() {
            let callback: Box<dyn Hotplug<Context>> = Box::new(HotplugCallback {
                devices: self.devices.clone(),
                events: events.clone(),
            });
            // Devices already present are reported during registration
            let registration = HotplugBuilder::new()
                .enumerate(true)
                .register(&self.context, callback)
                .map_err(|e| HostError::Other(format!("hot-plug registration failed: {}", e)))?;
            state.registration = Some(registration);
            debug!("Hot-plug callbacks registered");
        } else {
            warn!("libusb has no hot-plug support, enumerating once");
            self.enumerate(&events)
                .map_err(|e| HostError::Other(format!("enumeration failed: {}", e)))?;
        }

        state.events = Some(events);
        Ok(())
    }

    fn deregister_client(&self) -> Result<(), HostError> {
        let mut state = self.lock();
        let events = state.events.take().ok_or(HostError::NoClient)?;
        // Dropping the registration deregisters the callback
        state.registration = None;
        drop(events);
        self.devices.lock().unwrap_or_else(|e| e.into_inner()).clear();
        debug!("Host client deregistered");
        Ok(())
    }

    fn open_interface(
        &self,
        device: DeviceAddress,
        interfaces: &[u8],
    ) -> Result<Box<dyn InterfaceLink>, HostError> {
        let events = self.lock().events.clone().ok_or(HostError::NoClient)?;
        let usb_device = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&device)
            .cloned()
            .ok_or(HostError::DeviceNotFound(device))?;

        let link = RusbLink::open(&usb_device, interfaces, events)?;
        info!("Claimed interfaces {:?} on {}", interfaces, device);
        Ok(Box::new(link))
    }
}

/// Hot-plug callback handler
///
/// Snapshots arriving devices, remembers them for `open_interface` and
/// forwards arrival and removal to the registered client.
struct HotplugCallback {
    devices: DeviceMap,
    events: HostEventSender,
}

impl Hotplug<Context> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<Context>) {
        let address = device_address(&device);
        if is_hub(&device) {
            debug!("Skipping hub at {}", address);
            return;
        }

        let arrival = match snapshot(&device) {
            Ok(arrival) => arrival,
            Err(e) => {
                warn!("Failed to read descriptors of {}: {}", address, e);
                return;
            }
        };
        debug!(
            "Hot-plug: device arrived {} {:04x}:{:04x}",
            address, arrival.vendor_id, arrival.product_id
        );

        self.devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address, device);
        if let Err(e) = self.events.send_blocking(HostEvent::DeviceArrived(arrival)) {
            error!("Failed to send DeviceArrived event: {}", e);
        }
    }

    fn device_left(&mut self, device: Device<Context>) {
        let address = device_address(&device);
        let known = self
            .devices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&address)
            .is_some();
        if !known {
            return;
        }

        debug!("Hot-plug: device left {}", address);
        if let Err(e) = self.events.send_blocking(HostEvent::DeviceLeft(address)) {
            error!("Failed to send DeviceLeft event: {}", e);
        }
    }
}
