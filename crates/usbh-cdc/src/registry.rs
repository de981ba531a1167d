//! Device registry
//!
//! Generation-tagged arena of devices plus the list of physical devices the
//! host layer currently reports. Guarded by the driver's registry mutex; the
//! dispatch task is the only one that binds devices to physical devices.

use crate::config::DeviceConfig;
use crate::device::{Device, DeviceHandle, DeviceIdentity, DeviceState};
use crate::error::{Error, Result};
use crate::scheduler::{DataPath, Link};
use common::usb_types::{CLASS_CDC_COMM, CLASS_CDC_DATA};
use common::{DeviceAddress, DeviceArrival};
use std::sync::Arc;
use std::sync::mpsc::SyncSender;

/// Most devices one driver instance manages at a time
pub const MAX_DEVICES: usize = 256;

pub(crate) struct Entry {
    pub device: Arc<Device>,
    pub link: Option<Link>,
    /// Physical device the link was opened on
    pub bound_to: Option<DeviceAddress>,
    /// Signalled once a deleted device is gone
    pub delete_waiter: Option<SyncSender<()>>,
    seq: u64,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

#[derive(Default)]
pub(crate) struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
    next_seq: u64,
    /// Present physical devices in arrival order
    physical: Vec<DeviceArrival>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Register a new device in the CREATED state
    pub fn insert(&mut self, config: &DeviceConfig) -> Result<Arc<Device>> {
        let identity = config.identity();
        if self.entries().any(|e| e.device.identity == identity) {
            return Err(Error::AlreadyExists);
        }

        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < MAX_DEVICES => {
                self.slots.push(Slot {
                    generation: 1,
                    entry: None,
                });
                (self.slots.len() - 1) as u32
            }
            None => return Err(Error::OutOfMemory),
        };

        let handle = DeviceHandle {
            index,
            generation: self.slots[index as usize].generation,
        };
        let device = match Device::new(handle, config) {
            Ok(device) => Arc::new(device),
            Err(e) => {
                self.free.push(index);
                return Err(e);
            }
        };

        self.slots[index as usize].entry = Some(Entry {
            device: device.clone(),
            link: None,
            bound_to: None,
            delete_waiter: None,
            seq: self.next_seq,
        });
        self.next_seq += 1;
        self.len += 1;
        Ok(device)
    }

    pub fn get(&self, handle: DeviceHandle) -> Option<&Entry> {
        let slot = self.slots.get(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_ref()
    }

    pub fn get_mut(&mut self, handle: DeviceHandle) -> Option<&mut Entry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.entry.as_mut()
    }

    pub fn device(&self, handle: DeviceHandle) -> Result<Arc<Device>> {
        self.get(handle)
            .map(|entry| entry.device.clone())
            .ok_or_else(|| Error::invalid_handle(handle))
    }

    /// Drop a device; its handle (and every copy of it) turns stale
    pub fn remove(&mut self, handle: DeviceHandle) -> Option<Entry> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let entry = slot.entry.take()?;
        slot.generation = slot.generation.wrapping_add(1).max(1);
        self.free.push(handle.index);
        self.len -= 1;
        Some(entry)
    }

    fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    pub fn handles(&self) -> Vec<DeviceHandle> {
        self.entries().map(|e| e.device.handle).collect()
    }

    pub fn add_physical(&mut self, arrival: DeviceArrival) {
        self.physical.retain(|dev| dev.address != arrival.address);
        self.physical.push(arrival);
    }

    pub fn remove_physical(&mut self, address: DeviceAddress) -> Option<DeviceArrival> {
        let index = self.physical.iter().position(|dev| dev.address == address)?;
        Some(self.physical.remove(index))
    }

    pub fn physical(&self) -> &[DeviceArrival] {
        &self.physical
    }

    /// Devices holding (or draining) a link on `address`
    pub fn bound_to(&self, address: DeviceAddress) -> Vec<DeviceHandle> {
        self.entries()
            .filter(|e| e.bound_to == Some(address))
            .map(|e| e.device.handle)
            .collect()
    }

    /// Whether any of `interfaces` on `address` is claimed by a device
    pub fn is_claimed(&self, address: DeviceAddress, interfaces: &[u8]) -> bool {
        self.entries().any(|e| {
            e.bound_to == Some(address)
                && e.link
                    .as_ref()
                    .is_some_and(|link| link.path().interfaces.iter().any(|n| interfaces.contains(n)))
        })
    }

    /// Devices waiting for `arrival`, exact vendor/product matches first
    pub fn candidates(&self, arrival: &DeviceArrival) -> Vec<DeviceHandle> {
        let mut found: Vec<&Entry> = self
            .entries()
            .filter(|e| e.device.state() == DeviceState::Created)
            .filter(|e| e.device.identity.matches(arrival))
            .collect();
        found.sort_by_key(|e| (e.device.identity.is_wildcard(), e.seq));
        found.into_iter().map(|e| e.device.handle).collect()
    }

    /// First present physical device `handle` could be opened on
    pub fn find_physical(&self, handle: DeviceHandle) -> Option<(DeviceArrival, DataPath)> {
        let identity = self.get(handle)?.device.identity;
        self.physical.iter().find_map(|arrival| {
            if !identity.matches(arrival) {
                return None;
            }
            let path = select_data_path(arrival, identity)?;
            if self.is_claimed(arrival.address, &path.interfaces) {
                return None;
            }
            Some((arrival.clone(), path))
        })
    }
}

/// Pick the endpoints a device identity would use on `arrival`
///
/// The requested interface either carries an IN/OUT pair itself, or it is a
/// CDC communications interface whose data interface follows it.
pub(crate) fn select_data_path(
    arrival: &DeviceArrival,
    identity: DeviceIdentity,
) -> Option<DataPath> {
    let requested = arrival.interface(identity.interface)?;

    if let Some((ep_in, ep_out)) = requested.data_endpoints() {
        return Some(DataPath {
            interfaces: vec![requested.number],
            ep_in,
            ep_out,
        });
    }

    if requested.class != CLASS_CDC_COMM {
        return None;
    }
    let data = arrival.interface(requested.number.checked_add(1)?)?;
    if data.class != CLASS_CDC_DATA {
        return None;
    }
    let (ep_in, ep_out) = data.data_endpoints()?;
    Some(DataPath {
        interfaces: vec![requested.number, data.number],
        ep_in,
        ep_out,
    })
}
