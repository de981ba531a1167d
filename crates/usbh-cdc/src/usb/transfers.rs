//! USB transfer execution
//!
//! libusb's synchronous API runs on one worker thread per endpoint. IN
//! transfers poll with a short timeout so that cancellation is noticed; OUT
//! transfers keep writing until the payload is out, the deadline passes or
//! the link is cancelled.

use common::{
    Direction, EndpointDesc, HostError, HostEvent, HostEventSender, Transfer, TransferCompletion,
    TransferKind, TransferStatus,
};
use rusb::{Context, DeviceHandle};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Poll interval of IN transfers
const IN_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Timeout of a single OUT write call
const OUT_CHUNK_TIMEOUT: Duration = Duration::from_secs(1);

/// Give up on an OUT transfer the device does not accept within this time
const OUT_DEADLINE: Duration = Duration::from_secs(5);

/// Transfers an endpoint worker accepts before refusing more
pub const ENDPOINT_QUEUE_DEPTH: usize = 4;

/// Worker thread owning the transfers of one endpoint
pub struct EndpointWorker {
    endpoint: EndpointDesc,
    queue: async_channel::Sender<Transfer>,
    join: Option<JoinHandle<()>>,
}

impl EndpointWorker {
    pub fn spawn(
        handle: Arc<DeviceHandle<Context>>,
        endpoint: EndpointDesc,
        events: HostEventSender,
        cancelled: Arc<AtomicBool>,
    ) -> Result<Self, HostError> {
        let (queue, jobs) = async_channel::bounded::<Transfer>(ENDPOINT_QUEUE_DEPTH);

        let join = std::thread::Builder::new()
            .name(format!("usb-ep-{:02x}", endpoint.address))
            .spawn(move || {
                while let Ok(transfer) = jobs.recv_blocking() {
                    let completion = execute_transfer(&handle, transfer, &cancelled);
                    if events
                        .send_blocking(HostEvent::TransferCompleted(completion))
                        .is_err()
                    {
                        debug!("Host client gone, stopping endpoint {:#04x}", endpoint.address);
                        break;
                    }
                }
            })
            .map_err(|e| HostError::Other(format!("failed to spawn endpoint worker: {}", e)))?;

        Ok(Self {
            endpoint,
            queue,
            join: Some(join),
        })
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint.address
    }

    /// Queue a transfer without blocking
    pub fn submit(&self, transfer: Transfer) -> Result<(), (HostError, Transfer)> {
        self.queue.try_send(transfer).map_err(|e| match e {
            async_channel::TrySendError::Full(t) => (HostError::Busy, t),
            async_channel::TrySendError::Closed(t) => (HostError::NoDevice, t),
        })
    }

    /// Close the queue and wait for the thread to finish
    pub fn stop(&mut self) {
        self.queue.close();
        if let Some(join) = self.join.take()
            && join.join().is_err()
        {
            warn!("Endpoint worker {:#04x} panicked", self.endpoint.address);
        }
    }
}

impl Drop for EndpointWorker {
    fn drop(&mut self) {
        self.queue.close();
    }
}

/// Execute a transfer and build its completion
pub fn execute_transfer(
    handle: &DeviceHandle<Context>,
    mut transfer: Transfer,
    cancelled: &AtomicBool,
) -> TransferCompletion {
    if cancelled.load(Ordering::Acquire) {
        return TransferCompletion::from_transfer(transfer, TransferStatus::Cancelled, 0);
    }

    let length = transfer.length.min(transfer.buffer.len());
    let (endpoint, kind) = (transfer.endpoint, transfer.kind);
    let (status, actual) = match transfer.direction() {
        Direction::In => read_in(handle, endpoint, kind, &mut transfer.buffer[..length], cancelled),
        Direction::Out => write_out(handle, endpoint, kind, &transfer.buffer[..length], cancelled),
    };

    trace!(
        "Endpoint {:#04x} transfer {:?}: {:?}, {}/{} bytes",
        endpoint, transfer.tag, status, actual, length
    );
    TransferCompletion::from_transfer(transfer, status, actual)
}

fn read_in(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    kind: TransferKind,
    buffer: &mut [u8],
    cancelled: &AtomicBool,
) -> (TransferStatus, usize) {
    loop {
        if cancelled.load(Ordering::Acquire) {
            return (TransferStatus::Cancelled, 0);
        }
        let result = match kind {
            TransferKind::Bulk => handle.read_bulk(endpoint, buffer, IN_POLL_TIMEOUT),
            TransferKind::Interrupt => handle.read_interrupt(endpoint, buffer, IN_POLL_TIMEOUT),
        };
        match result {
            Ok(n) => return (TransferStatus::Completed, n),
            // Device has nothing to send yet
            Err(rusb::Error::Timeout) => continue,
            Err(e) => return (map_transfer_error(e), 0),
        }
    }
}

fn write_out(
    handle: &DeviceHandle<Context>,
    endpoint: u8,
    kind: TransferKind,
    data: &[u8],
    cancelled: &AtomicBool,
) -> (TransferStatus, usize) {
    let deadline = Instant::now() + OUT_DEADLINE;
    let mut sent = 0;

    while sent < data.len() {
        if cancelled.load(Ordering::Acquire) {
            return (TransferStatus::Cancelled, sent);
        }
        let result = match kind {
            TransferKind::Bulk => handle.write_bulk(endpoint, &data[sent..], OUT_CHUNK_TIMEOUT),
            TransferKind::Interrupt => {
                handle.write_interrupt(endpoint, &data[sent..], OUT_CHUNK_TIMEOUT)
            }
        };
        match result {
            Ok(n) => sent += n,
            Err(rusb::Error::Timeout) if Instant::now() < deadline => continue,
            Err(e) => return (map_transfer_error(e), sent),
        }
    }
    (TransferStatus::Completed, sent)
}

/// Map rusb::Error to the status reported in a completion
pub fn map_transfer_error(err: rusb::Error) -> TransferStatus {
    match err {
        rusb::Error::Timeout => TransferStatus::TimedOut,
        rusb::Error::Pipe => TransferStatus::Stall,
        rusb::Error::NoDevice => TransferStatus::NoDevice,
        rusb::Error::Overflow => TransferStatus::Overflow,
        rusb::Error::Interrupted => TransferStatus::Cancelled,
        _ => TransferStatus::Error(err.to_string()),
    }
}

/// Map rusb::Error to a host layer error
pub fn map_host_error(err: rusb::Error) -> HostError {
    match err {
        rusb::Error::Access => HostError::Access,
        rusb::Error::Busy => HostError::Busy,
        rusb::Error::NoDevice | rusb::Error::NotFound => HostError::NoDevice,
        _ => HostError::Other(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_transfer_error() {
        assert_eq!(map_transfer_error(rusb::Error::Timeout), TransferStatus::TimedOut);
        assert_eq!(map_transfer_error(rusb::Error::Pipe), TransferStatus::Stall);
        assert_eq!(map_transfer_error(rusb::Error::NoDevice), TransferStatus::NoDevice);
        assert_eq!(map_transfer_error(rusb::Error::Overflow), TransferStatus::Overflow);
        assert!(map_transfer_error(rusb::Error::Io).is_fatal());
        assert!(!map_transfer_error(rusb::Error::Interrupted).is_fatal());
    }

    #[test]
    fn test_map_host_error() {
        assert_eq!(map_host_error(rusb::Error::Access), HostError::Access);
        assert_eq!(map_host_error(rusb::Error::Busy), HostError::Busy);
        assert_eq!(map_host_error(rusb::Error::NotFound), HostError::NoDevice);
        assert!(matches!(map_host_error(rusb::Error::Io), HostError::Other(_)));
    }
}
