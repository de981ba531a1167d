//! USB device access
//!
//! Descriptor snapshots for arriving devices and the claimed-interface link
//! the driver moves data over.

use crate::usb::transfers::{EndpointWorker, map_host_error};
use common::{
    DeviceAddress, DeviceArrival, EndpointDesc, HostError, HostEventSender, InterfaceDesc,
    InterfaceLink, Transfer, TransferKind,
};
use rusb::{Context, Device, DeviceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

/// USB hub device class; hubs never carry a byte stream
pub const CLASS_HUB: u8 = 0x09;

/// Address of a rusb device on the host
pub fn device_address(device: &Device<Context>) -> DeviceAddress {
    DeviceAddress::new(device.bus_number(), device.address())
}

/// Read the descriptors of a device into a [`DeviceArrival`]
///
/// Uses the active configuration, or the first one if the device is not
/// configured, and alternate setting 0 of every interface.
pub fn snapshot(device: &Device<Context>) -> Result<DeviceArrival, rusb::Error> {
    let descriptor = device.device_descriptor()?;
    let config = device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))?;

    let interfaces = config
        .interfaces()
        .filter_map(|interface| interface.descriptors().find(|d| d.setting_number() == 0))
        .map(|d| InterfaceDesc {
            number: d.interface_number(),
            class: d.class_code(),
            subclass: d.sub_class_code(),
            protocol: d.protocol_code(),
            endpoints: d
                .endpoint_descriptors()
                .filter_map(|ep| {
                    Some(EndpointDesc {
                        address: ep.address(),
                        kind: map_transfer_type(ep.transfer_type())?,
                        max_packet_size: ep.max_packet_size(),
                    })
                })
                .collect(),
        })
        .collect();

    Ok(DeviceArrival {
        address: device_address(device),
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        class: descriptor.class_code(),
        subclass: descriptor.sub_class_code(),
        protocol: descriptor.protocol_code(),
        interfaces,
    })
}

/// Only bulk and interrupt endpoints can carry the byte stream
fn map_transfer_type(transfer_type: rusb::TransferType) -> Option<TransferKind> {
    match transfer_type {
        rusb::TransferType::Bulk => Some(TransferKind::Bulk),
        rusb::TransferType::Interrupt => Some(TransferKind::Interrupt),
        _ => None,
    }
}

/// Claimed interfaces on an open device
pub struct RusbLink {
    address: DeviceAddress,
    handle: Arc<DeviceHandle<Context>>,
    interfaces: Vec<u8>,
    /// Interfaces whose kernel driver we detached
    detached: Vec<u8>,
    workers: Vec<EndpointWorker>,
    cancelled: Arc<AtomicBool>,
}

impl RusbLink {
    /// Open `device`, claim `interfaces` and start a worker per endpoint
    ///
    /// Everything done so far is undone when a step fails.
    pub fn open(
        device: &Device<Context>,
        interfaces: &[u8],
        events: HostEventSender,
    ) -> Result<Self, HostError> {
        let address = device_address(device);
        let arrival = snapshot(device).map_err(map_host_error)?;
        if let Some(&missing) = interfaces.iter().find(|n| arrival.interface(**n).is_none()) {
            return Err(HostError::InterfaceNotFound {
                device: address,
                interface: missing,
            });
        }

        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", address, e);
            map_host_error(e)
        })?;
        debug!("Opened device {}", address);

        let mut claimed = Vec::new();
        let mut detached = Vec::new();
        for &number in interfaces {
            match handle.kernel_driver_active(number) {
                Ok(true) => {
                    debug!("Detaching kernel driver from interface {} on {}", number, address);
                    match handle.detach_kernel_driver(number) {
                        Ok(()) => detached.push(number),
                        Err(e) => warn!("Failed to detach kernel driver from interface {}: {}", number, e),
                    }
                }
                Ok(false) => {}
                Err(e) => debug!("Could not check kernel driver on interface {}: {}", number, e),
            }

            if let Err(e) = handle.claim_interface(number) {
                warn!("Failed to claim interface {} on {}: {}", number, address, e);
                release_interfaces(&mut handle, address, &claimed, &detached);
                return Err(map_host_error(e));
            }
            debug!("Claimed interface {} on {}", number, address);
            claimed.push(number);
        }

        let handle = Arc::new(handle);
        let cancelled = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::new();
        let endpoints = interfaces
            .iter()
            .filter_map(|n| arrival.interface(*n))
            .flat_map(|itf| itf.endpoints.iter().copied());
        for endpoint in endpoints {
            match EndpointWorker::spawn(handle.clone(), endpoint, events.clone(), cancelled.clone())
            {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    let mut link = Self {
                        address,
                        handle,
                        interfaces: claimed,
                        detached,
                        workers,
                        cancelled,
                    };
                    link.shutdown();
                    return Err(e);
                }
            }
        }

        Ok(Self {
            address,
            handle,
            interfaces: claimed,
            detached,
            workers,
            cancelled,
        })
    }

    /// Stop the workers and hand the interfaces back to the system
    fn shutdown(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        for worker in &mut self.workers {
            worker.stop();
        }
        self.workers.clear();

        match Arc::get_mut(&mut self.handle) {
            Some(handle) => release_interfaces(handle, self.address, &self.interfaces, &self.detached),
            // Dropping the last reference releases the interfaces too
            None => warn!("Device {} handle still shared at release", self.address),
        }
        self.interfaces.clear();
        self.detached.clear();
    }
}

fn release_interfaces(
    handle: &mut DeviceHandle<Context>,
    address: DeviceAddress,
    claimed: &[u8],
    detached: &[u8],
) {
    for &number in claimed {
        if let Err(e) = handle.release_interface(number) {
            warn!("Failed to release interface {} on {}: {}", number, address, e);
        }
    }
    for &number in detached {
        match handle.attach_kernel_driver(number) {
            Ok(()) => debug!("Reattached kernel driver to interface {} on {}", number, address),
            Err(e) => debug!("Could not reattach kernel driver to interface {}: {}", number, e),
        }
    }
}

impl InterfaceLink for RusbLink {
    fn submit(&mut self, transfer: Transfer) -> Result<(), (HostError, Transfer)> {
        match self.workers.iter().find(|w| w.endpoint() == transfer.endpoint) {
            Some(worker) => worker.submit(transfer),
            None => Err((HostError::InvalidEndpoint(transfer.endpoint), transfer)),
        }
    }

    fn cancel_all(&mut self) {
        self.cancelled.store(true, Ordering::Release);
    }

    fn release(mut self: Box<Self>) {
        self.shutdown();
        debug!("Closed device {}", self.address);
    }
}

impl Drop for RusbLink {
    fn drop(&mut self) {
        if !self.workers.is_empty() || !self.interfaces.is_empty() {
            self.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_type() {
        assert_eq!(
            map_transfer_type(rusb::TransferType::Bulk),
            Some(TransferKind::Bulk)
        );
        assert_eq!(
            map_transfer_type(rusb::TransferType::Interrupt),
            Some(TransferKind::Interrupt)
        );
        assert_eq!(map_transfer_type(rusb::TransferType::Control), None);
        assert_eq!(map_transfer_type(rusb::TransferType::Isochronous), None);
    }
}
