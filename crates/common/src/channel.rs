//! Async channel bridge between the USB host layer and the driver's dispatch task
//!
//! The host layer produces events from its own threads (hot-plug callbacks,
//! transfer workers) with blocking sends; the dispatch task consumes them
//! asynchronously.

use crate::usb_types::{DeviceAddress, DeviceArrival, TransferCompletion};
use async_channel::{Receiver, Sender, bounded};

/// Default capacity of the host event queue
pub const DEFAULT_EVENT_QUEUE_DEPTH: usize = 256;

/// Events from the host layer to the driver
#[derive(Debug)]
pub enum HostEvent {
    /// A physical device was detected
    DeviceArrived(DeviceArrival),

    /// A physical device was removed
    DeviceLeft(DeviceAddress),

    /// A submitted transfer finished (successfully or not)
    TransferCompleted(TransferCompletion),
}

/// Handle for the host layer (blocking producer side)
#[derive(Clone)]
pub struct HostEventSender {
    tx: Sender<HostEvent>,
}

impl HostEventSender {
    /// Send an event to the dispatch task, waiting for queue space
    pub fn send_blocking(&self, event: HostEvent) -> crate::Result<()> {
        self.tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the dispatch task (async consumer side)
pub struct HostEventReceiver {
    rx: Receiver<HostEvent>,
}

impl HostEventReceiver {
    /// Receive the next host event
    pub async fn recv(&self) -> crate::Result<HostEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&self) -> Option<HostEvent> {
        self.rx.try_recv().ok()
    }

    /// Close the channel so that producers observe the shutdown
    pub fn close(&self) {
        self.rx.close();
    }
}

/// Create the channel bridge between the host layer and the dispatch task
///
/// Returns (HostEventSender for the host layer, HostEventReceiver for the driver)
pub fn create_host_channel(depth: usize) -> (HostEventSender, HostEventReceiver) {
    let (tx, rx) = bounded(depth.max(1));
    (HostEventSender { tx }, HostEventReceiver { rx })
}
