//! Dispatch task
//!
//! Single consumer of host events and application commands. Runs on the
//! driver's dedicated thread inside a current-thread Tokio runtime and owns
//! every device state transition that involves the host layer: claiming
//! interfaces, submitting and completing transfers, tearing links down.
//!
//! Registry changes happen under the registry mutex. Application callbacks
//! are collected while the mutex is held and run after it is released, so a
//! callback may call back into the non-blocking parts of the driver.

use crate::config::NewDeviceCallback;
use crate::device::{Device, DeviceEvent, DeviceHandle, DeviceState};
use crate::registry::{Entry, Registry};
use crate::scheduler::{DataPath, Link, decode_tag};
use common::{
    DeviceAddress, DeviceArrival, HostEvent, HostEventReceiver, HostEventSender, TransferCompletion,
    UsbHost,
};
use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, error, info, trace, warn};

/// Requests from application threads to the dispatch task
#[derive(Debug)]
pub(crate) enum Command {
    /// A new device wants to look at physical devices already present
    Probe(DeviceHandle),
    /// A pipe gained data or space
    Service(DeviceHandle),
    /// Tear a device down; `done` fires once it is gone
    Delete {
        handle: DeviceHandle,
        done: SyncSender<()>,
    },
    Shutdown,
}

type Notifications = Vec<(Arc<Device>, DeviceEvent)>;

pub(crate) struct DispatchTask {
    host: Arc<dyn UsbHost>,
    registry: Arc<Mutex<Registry>>,
    events: HostEventReceiver,
    /// Keeps the event channel open while the host client is deregistered
    _events_tx: HostEventSender,
    commands: async_channel::Receiver<Command>,
    new_device_callback: Option<NewDeviceCallback>,
}

impl DispatchTask {
    pub fn new(
        host: Arc<dyn UsbHost>,
        registry: Arc<Mutex<Registry>>,
        events: (HostEventSender, HostEventReceiver),
        commands: async_channel::Receiver<Command>,
        new_device_callback: Option<NewDeviceCallback>,
    ) -> Self {
        Self {
            host,
            registry,
            events: events.1,
            _events_tx: events.0,
            commands,
            new_device_callback,
        }
    }

    /// Process events and commands until Shutdown
    pub async fn run(self) {
        info!("Dispatch task started");

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => match command {
                    Ok(Command::Shutdown) => {
                        info!("Dispatch task shutting down");
                        break;
                    }
                    Ok(command) => self.handle_command(command),
                    Err(_) => {
                        warn!("Command channel closed");
                        break;
                    }
                },

                event = self.events.recv() => match event {
                    Ok(event) => self.handle_event(event),
                    Err(e) => {
                        error!("Host event channel failed: {}", e);
                        break;
                    }
                },
            }
        }

        self.events.close();
        info!("Dispatch task stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn handle_command(&self, command: Command) {
        // A panic here would take the whole driver down with it
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            self.handle_command_inner(command)
        }));
        if let Err(e) = result {
            error!("Panic in dispatch command handler: {:?}", e);
        }
    }

    fn handle_command_inner(&self, command: Command) {
        let mut notes = Notifications::new();

        match command {
            Command::Probe(handle) => {
                let mut registry = self.lock();
                let waiting = registry
                    .get(handle)
                    .is_some_and(|e| e.device.state() == DeviceState::Created);
                if waiting && let Some((arrival, path)) = registry.find_physical(handle) {
                    debug!("Device {} found present device {}", handle, arrival.address);
                    self.connect(&mut registry, handle, &arrival, path, &mut notes);
                }
            }

            Command::Service(handle) => {
                let mut registry = self.lock();
                if let Some(entry) = registry.get_mut(handle) {
                    entry.device.clear_service_request();
                    service(entry, &mut notes);
                }
                settle(&mut registry, handle);
            }

            Command::Delete { handle, done } => {
                let mut registry = self.lock();
                match registry.get_mut(handle) {
                    Some(entry) => {
                        debug!("Deleting device {}", handle);
                        entry.delete_waiter = Some(done);
                        if let Some(link) = entry.link.as_mut() {
                            link.cancel();
                        }
                        entry.device.rx.notify();
                        settle(&mut registry, handle);
                    }
                    None => {
                        let _ = done.send(());
                    }
                }
            }

            Command::Shutdown => {
                // Handled by the run loop
            }
        }

        fire(notes);
    }

    fn handle_event(&self, event: HostEvent) {
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| match event {
            HostEvent::DeviceArrived(arrival) => self.on_device_arrived(arrival),
            HostEvent::DeviceLeft(address) => self.on_device_left(address),
            HostEvent::TransferCompleted(completion) => self.on_transfer_completed(completion),
        }));
        if let Err(e) = result {
            error!("Panic in host event handler: {:?}", e);
        }
    }

    fn on_device_arrived(&self, arrival: DeviceArrival) {
        debug!(
            "Device arrived: {} {:04x}:{:04x} ({} interfaces)",
            arrival.address,
            arrival.vendor_id,
            arrival.product_id,
            arrival.interfaces.len()
        );

        if let Some(callback) = &self.new_device_callback {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(&arrival)
            }));
            if result.is_err() {
                error!("Panic in new device callback for {}", arrival.address);
            }
        }

        let mut notes = Notifications::new();
        {
            let mut registry = self.lock();
            registry.add_physical(arrival.clone());

            for handle in registry.candidates(&arrival) {
                let Some(identity) = registry.get(handle).map(|e| e.device.identity) else {
                    continue;
                };
                let Some(path) = crate::registry::select_data_path(&arrival, identity) else {
                    trace!("Device {} has no usable interface on {}", handle, arrival.address);
                    continue;
                };
                if registry.is_claimed(arrival.address, &path.interfaces) {
                    continue;
                }
                self.connect(&mut registry, handle, &arrival, path, &mut notes);
            }
        }
        fire(notes);
    }

    fn on_device_left(&self, address: DeviceAddress) {
        debug!("Device left: {}", address);

        let mut notes = Notifications::new();
        {
            let mut registry = self.lock();
            registry.remove_physical(address);
            for handle in registry.bound_to(address) {
                if let Some(entry) = registry.get_mut(handle) {
                    disconnect(entry, &mut notes);
                }
                settle(&mut registry, handle);
            }
        }
        fire(notes);
    }

    fn on_transfer_completed(&self, completion: TransferCompletion) {
        let (handle, direction, slot) = decode_tag(completion.tag);

        let mut notes = Notifications::new();
        {
            let mut registry = self.lock();
            let Some(entry) = registry.get_mut(handle) else {
                trace!("Completion for stale device {}", handle);
                return;
            };
            let Some(link) = entry.link.as_mut() else {
                trace!("Completion for device {} without a link", handle);
                return;
            };

            let outcome = link.on_completion(&entry.device, completion, direction, slot);
            if outcome.received > 0 && entry.device.is_connected() {
                notes.push((entry.device.clone(), DeviceEvent::DataReceived));
            }

            if outcome.fatal {
                disconnect(entry, &mut notes);
            } else {
                service(entry, &mut notes);
            }
            settle(&mut registry, handle);
        }
        fire(notes);
    }

    /// Claim `path` on `arrival` for a CREATED device and start its transfers
    fn connect(
        &self,
        registry: &mut Registry,
        handle: DeviceHandle,
        arrival: &DeviceArrival,
        path: DataPath,
        notes: &mut Notifications,
    ) {
        let Some(entry) = registry.get_mut(handle) else {
            return;
        };
        let device = entry.device.clone();
        if !device.transition(DeviceState::Created, DeviceState::Opening) {
            return;
        }

        let iface = match self.host.open_interface(arrival.address, &path.interfaces) {
            Ok(iface) => iface,
            Err(e) => {
                warn!(
                    "Failed to claim interfaces {:?} on {} for device {}: {}",
                    path.interfaces, arrival.address, handle, e
                );
                device.set_state(DeviceState::Created);
                return;
            }
        };

        let interfaces = path.interfaces.clone();
        let link = match Link::new(iface, path, handle, device.slots) {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to set up transfers for device {}: {}", handle, e);
                device.set_state(DeviceState::Created);
                return;
            }
        };

        entry.link = Some(link);
        entry.bound_to = Some(arrival.address);
        device.set_info(Some(arrival.clone()));
        device.transition(DeviceState::Opening, DeviceState::Connected);
        info!(
            "Device {} ({}) connected to {} interfaces {:?}",
            handle, device.identity, arrival.address, interfaces
        );
        notes.push((device, DeviceEvent::Connected));

        service(entry, notes);
    }
}

/// Submit what the pipes allow; a refused submission disconnects the device
fn service(entry: &mut Entry, notes: &mut Notifications) {
    if !entry.device.is_connected() {
        return;
    }
    let Some(link) = entry.link.as_mut() else {
        return;
    };
    if let Err(e) = link.service(&entry.device) {
        warn!("Device {} submission refused: {}", entry.device.handle, e);
        disconnect(entry, notes);
    }
}

/// Stop all transfers of a device and report the loss of its link
///
/// A device being deleted goes quietly.
fn disconnect(entry: &mut Entry, notes: &mut Notifications) {
    if let Some(link) = entry.link.as_mut() {
        link.cancel();
    }
    if entry
        .device
        .transition(DeviceState::Connected, DeviceState::Disconnected)
    {
        info!("Device {} disconnected", entry.device.handle);
        notes.push((entry.device.clone(), DeviceEvent::Disconnected));
    }
    entry.device.rx.notify();
}

/// Release a drained link and finish a pending delete
fn settle(registry: &mut Registry, handle: DeviceHandle) {
    let Some(entry) = registry.get_mut(handle) else {
        return;
    };
    if entry.link.as_ref().is_some_and(|l| !l.is_quiescent()) {
        return;
    }

    if entry.link.as_ref().is_some_and(|l| l.is_cancelling())
        && let Some(link) = entry.link.take()
    {
        link.release();
        entry.bound_to = None;
        debug!("Device {} released its interfaces", handle);
    }

    let finished = entry.device.state() == DeviceState::Closing && entry.delete_waiter.is_some();
    if finished && let Some(mut entry) = registry.remove(handle) {
        if let Some(link) = entry.link.take() {
            link.release();
        }
        info!("Device {} deleted", handle);
        if let Some(done) = entry.delete_waiter.take() {
            let _ = done.send(());
        }
    }
}

/// Run collected callbacks, in order, with no lock held
fn fire(notes: Notifications) {
    for (device, event) in notes {
        device.fire(event);
    }
}
