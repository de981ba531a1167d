//! Test utilities for usbh-cdc
//!
//! Provides a simulated host layer ([`MockHost`]), canned device descriptors
//! and helper functions for testing across crates.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{create_mock_cdc_acm_arrival, MockHost};
//! use common::DeviceAddress;
//!
//! let host = MockHost::new();
//! host.plug(create_mock_cdc_acm_arrival(DeviceAddress::new(1, 2), 0x1234, 0x5678));
//! assert_eq!(host.present_devices().len(), 1);
//! ```

use crate::channel::{HostEvent, HostEventSender};
use crate::host::{HostError, InterfaceLink, UsbHost};
use crate::usb_types::{
    CLASS_CDC_COMM, CLASS_CDC_DATA, DeviceAddress, DeviceArrival, Direction, EndpointDesc,
    InterfaceDesc, Transfer, TransferCompletion, TransferKind, TransferStatus,
};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Max packet size used by the mock descriptors (full-speed bulk)
pub const MOCK_MAX_PACKET_SIZE: u16 = 64;

/// Create a CDC-ACM style device: a communications interface (0) with an
/// interrupt notification endpoint and a data interface (1) with a bulk pair
pub fn create_mock_cdc_acm_arrival(
    address: DeviceAddress,
    vendor_id: u16,
    product_id: u16,
) -> DeviceArrival {
    DeviceArrival {
        address,
        vendor_id,
        product_id,
        class: 0xEF, // Miscellaneous (IAD)
        subclass: 0x02,
        protocol: 0x01,
        interfaces: vec![
            InterfaceDesc {
                number: 0,
                class: CLASS_CDC_COMM,
                subclass: 0x02, // ACM
                protocol: 0x01, // AT commands
                endpoints: vec![EndpointDesc {
                    address: 0x83,
                    kind: TransferKind::Interrupt,
                    max_packet_size: 16,
                }],
            },
            InterfaceDesc {
                number: 1,
                class: CLASS_CDC_DATA,
                subclass: 0x00,
                protocol: 0x00,
                endpoints: vec![
                    EndpointDesc {
                        address: 0x81,
                        kind: TransferKind::Bulk,
                        max_packet_size: MOCK_MAX_PACKET_SIZE,
                    },
                    EndpointDesc {
                        address: 0x02,
                        kind: TransferKind::Bulk,
                        max_packet_size: MOCK_MAX_PACKET_SIZE,
                    },
                ],
            },
        ],
    }
}

/// Create a vendor-specific serial bridge with one bulk interface (0)
pub fn create_mock_vendor_arrival(
    address: DeviceAddress,
    vendor_id: u16,
    product_id: u16,
) -> DeviceArrival {
    DeviceArrival {
        address,
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        interfaces: vec![InterfaceDesc {
            number: 0,
            class: 0xFF,
            subclass: 0x00,
            protocol: 0x00,
            endpoints: vec![
                EndpointDesc {
                    address: 0x81,
                    kind: TransferKind::Bulk,
                    max_packet_size: MOCK_MAX_PACKET_SIZE,
                },
                EndpointDesc {
                    address: 0x01,
                    kind: TransferKind::Bulk,
                    max_packet_size: MOCK_MAX_PACKET_SIZE,
                },
            ],
        }],
    }
}

/// Create a HID keyboard: interrupt IN only, never a byte-stream candidate
pub fn create_mock_hid_arrival(
    address: DeviceAddress,
    vendor_id: u16,
    product_id: u16,
) -> DeviceArrival {
    DeviceArrival {
        address,
        vendor_id,
        product_id,
        class: 0x00,
        subclass: 0x00,
        protocol: 0x00,
        interfaces: vec![InterfaceDesc {
            number: 0,
            class: 0x03,
            subclass: 0x01,
            protocol: 0x01,
            endpoints: vec![EndpointDesc {
                address: 0x81,
                kind: TransferKind::Interrupt,
                max_packet_size: 8,
            }],
        }],
    }
}

/// Create mock bulk transfer data of specified size
pub fn create_mock_bulk_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Timeout wrapper for async tests
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

/// A transfer the mock host currently holds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTransfer {
    pub device: DeviceAddress,
    pub endpoint: u8,
    pub length: usize,
    /// Payload for OUT transfers, empty for IN
    pub data: Vec<u8>,
}

#[derive(Default)]
struct MockState {
    installed: bool,
    install_calls: usize,
    uninstall_calls: usize,
    events: Option<HostEventSender>,
    devices: BTreeMap<DeviceAddress, DeviceArrival>,
    claims: Vec<(DeviceAddress, Vec<u8>)>,
    releases: usize,
    in_flight: VecDeque<(DeviceAddress, Transfer)>,
    cancelled: Vec<Transfer>,
    deferred_cancel: bool,
    fail_install: bool,
    fail_register: bool,
    fail_claim: bool,
    fail_submit: bool,
}

/// Simulated USB host layer
///
/// Devices are plugged and unplugged by the test; transfers submitted by the
/// driver stay pending until the test completes them. Events are delivered
/// from a helper thread so that calls made on the dispatch task never wait on
/// its own queue.
#[derive(Clone, Default)]
pub struct MockHost {
    state: Arc<Mutex<MockState>>,
}

impl MockHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Attach a physical device
    pub fn plug(&self, arrival: DeviceArrival) {
        let sender = {
            let mut state = self.lock();
            state.devices.insert(arrival.address, arrival.clone());
            state.events.clone()
        };
        if let Some(sender) = sender {
            deliver(&sender, vec![HostEvent::DeviceArrived(arrival)]);
        }
    }

    /// Detach a physical device; its transfers can no longer be submitted
    pub fn unplug(&self, address: DeviceAddress) {
        let sender = {
            let mut state = self.lock();
            state.devices.remove(&address);
            state.events.clone()
        };
        if let Some(sender) = sender {
            deliver(&sender, vec![HostEvent::DeviceLeft(address)]);
        }
    }

    /// Complete the oldest pending IN transfer with `data`
    ///
    /// Returns the number of bytes delivered, or `None` if no IN transfer
    /// was pending.
    pub fn complete_in(&self, data: &[u8]) -> Option<usize> {
        let (sender, completion) = {
            let mut state = self.lock();
            let index = state
                .in_flight
                .iter()
                .position(|(_, t)| t.direction() == Direction::In)?;
            let (_, mut transfer) = state.in_flight.remove(index)?;
            let n = data.len().min(transfer.length).min(transfer.buffer.len());
            transfer.buffer[..n].copy_from_slice(&data[..n]);
            let completion = TransferCompletion::from_transfer(transfer, TransferStatus::Completed, n);
            (state.events.clone(), completion)
        };
        let n = completion.actual_length;
        if let Some(sender) = sender {
            deliver(&sender, vec![HostEvent::TransferCompleted(completion)]);
        }
        Some(n)
    }

    /// Complete the oldest pending OUT transfer and return its payload
    pub fn complete_out(&self) -> Option<Vec<u8>> {
        let (sender, completion) = {
            let mut state = self.lock();
            let index = state
                .in_flight
                .iter()
                .position(|(_, t)| t.direction() == Direction::Out)?;
            let (_, transfer) = state.in_flight.remove(index)?;
            let length = transfer.length;
            let completion =
                TransferCompletion::from_transfer(transfer, TransferStatus::Completed, length);
            (state.events.clone(), completion)
        };
        let payload = completion.data().to_vec();
        if let Some(sender) = sender {
            deliver(&sender, vec![HostEvent::TransferCompleted(completion)]);
        }
        Some(payload)
    }

    /// Complete the oldest pending transfer in `direction` with `status`
    pub fn fail_next(&self, direction: Direction, status: TransferStatus) -> bool {
        let (sender, completion) = {
            let mut state = self.lock();
            let Some(index) = state
                .in_flight
                .iter()
                .position(|(_, t)| t.direction() == direction)
            else {
                return false;
            };
            let Some((_, transfer)) = state.in_flight.remove(index) else {
                return false;
            };
            (
                state.events.clone(),
                TransferCompletion::from_transfer(transfer, status, 0),
            )
        };
        if let Some(sender) = sender {
            deliver(&sender, vec![HostEvent::TransferCompleted(completion)]);
        }
        true
    }

    /// Hold cancelled transfers until [`MockHost::finish_cancelled`] is called
    pub fn set_deferred_cancel(&self, deferred: bool) {
        self.lock().deferred_cancel = deferred;
    }

    /// Report completion of every cancelled transfer held back so far
    pub fn finish_cancelled(&self) -> usize {
        let (sender, events) = {
            let mut state = self.lock();
            let events: Vec<HostEvent> = state
                .cancelled
                .drain(..)
                .map(|t| {
                    HostEvent::TransferCompleted(TransferCompletion::from_transfer(
                        t,
                        TransferStatus::Cancelled,
                        0,
                    ))
                })
                .collect();
            (state.events.clone(), events)
        };
        let count = events.len();
        if let Some(sender) = sender {
            deliver(&sender, events);
        }
        count
    }

    pub fn set_fail_install(&self, fail: bool) {
        self.lock().fail_install = fail;
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.lock().fail_register = fail;
    }

    pub fn set_fail_claim(&self, fail: bool) {
        self.lock().fail_claim = fail;
    }

    pub fn set_fail_submit(&self, fail: bool) {
        self.lock().fail_submit = fail;
    }

    pub fn present_devices(&self) -> Vec<DeviceAddress> {
        self.lock().devices.keys().copied().collect()
    }

    /// Transfers currently held by the host, oldest first
    pub fn pending(&self) -> Vec<PendingTransfer> {
        self.lock()
            .in_flight
            .iter()
            .map(|(device, t)| PendingTransfer {
                device: *device,
                endpoint: t.endpoint,
                length: t.length,
                data: match t.direction() {
                    Direction::Out => t.buffer[..t.length].to_vec(),
                    Direction::In => Vec::new(),
                },
            })
            .collect()
    }

    pub fn pending_count(&self, direction: Direction) -> usize {
        self.lock()
            .in_flight
            .iter()
            .filter(|(_, t)| t.direction() == direction)
            .count()
    }

    /// Cancelled transfers whose completion is still held back
    pub fn cancelled_count(&self) -> usize {
        self.lock().cancelled.len()
    }

    /// Interfaces claimed and not yet released
    pub fn claims(&self) -> Vec<(DeviceAddress, Vec<u8>)> {
        self.lock().claims.clone()
    }

    pub fn release_count(&self) -> usize {
        self.lock().releases
    }

    pub fn is_installed(&self) -> bool {
        self.lock().installed
    }

    pub fn install_calls(&self) -> usize {
        self.lock().install_calls
    }

    pub fn uninstall_calls(&self) -> usize {
        self.lock().uninstall_calls
    }

    pub fn is_registered(&self) -> bool {
        self.lock().events.is_some()
    }
}

/// Deliver events from a helper thread, in order
fn deliver(sender: &HostEventSender, events: Vec<HostEvent>) {
    if events.is_empty() {
        return;
    }
    let sender = sender.clone();
    let handle = std::thread::spawn(move || {
        for event in events {
            if sender.send_blocking(event).is_err() {
                break;
            }
        }
    });
    // Keep delivery ordered with respect to the next call from the test
    let _ = handle.join();
}

impl UsbHost for MockHost {
    fn install(&self) -> Result<(), HostError> {
        let mut state = self.lock();
        state.install_calls += 1;
        if state.fail_install {
            return Err(HostError::Other("mock install failure".to_string()));
        }
        state.installed = true;
        Ok(())
    }

    fn uninstall(&self) -> Result<(), HostError> {
        let mut state = self.lock();
        state.uninstall_calls += 1;
        state.installed = false;
        Ok(())
    }

    fn register_client(&self, events: HostEventSender) -> Result<(), HostError> {
        let arrivals = {
            let mut state = self.lock();
            if state.fail_register {
                return Err(HostError::Other("mock register failure".to_string()));
            }
            if state.events.is_some() {
                return Err(HostError::ClientRegistered);
            }
            state.events = Some(events.clone());
            state
                .devices
                .values()
                .cloned()
                .map(HostEvent::DeviceArrived)
                .collect::<Vec<_>>()
        };
        deliver(&events, arrivals);
        Ok(())
    }

    fn deregister_client(&self) -> Result<(), HostError> {
        self.lock().events.take().map(|_| ()).ok_or(HostError::NoClient)
    }

    fn open_interface(
        &self,
        device: DeviceAddress,
        interfaces: &[u8],
    ) -> Result<Box<dyn InterfaceLink>, HostError> {
        let mut state = self.lock();
        if state.fail_claim {
            return Err(HostError::Access);
        }
        let arrival = state
            .devices
            .get(&device)
            .ok_or(HostError::DeviceNotFound(device))?;
        if let Some(&missing) = interfaces.iter().find(|n| arrival.interface(**n).is_none()) {
            return Err(HostError::InterfaceNotFound {
                device,
                interface: missing,
            });
        }
        let already_claimed = state.claims.iter().any(|(addr, itfs)| {
            *addr == device && itfs.iter().any(|n| interfaces.contains(n))
        });
        if already_claimed {
            return Err(HostError::Busy);
        }
        state.claims.push((device, interfaces.to_vec()));
        Ok(Box::new(MockLink {
            device,
            interfaces: interfaces.to_vec(),
            host: self.clone(),
        }))
    }
}

struct MockLink {
    device: DeviceAddress,
    interfaces: Vec<u8>,
    host: MockHost,
}

impl InterfaceLink for MockLink {
    fn submit(&mut self, transfer: Transfer) -> Result<(), (HostError, Transfer)> {
        let mut state = self.host.lock();
        if !state.devices.contains_key(&self.device) {
            return Err((HostError::NoDevice, transfer));
        }
        if state.fail_submit {
            return Err((HostError::Busy, transfer));
        }
        state.in_flight.push_back((self.device, transfer));
        Ok(())
    }

    fn cancel_all(&mut self) {
        let (sender, events) = {
            let mut state = self.host.lock();
            let (mine, others): (VecDeque<_>, VecDeque<_>) = state
                .in_flight
                .drain(..)
                .partition(|(device, _)| *device == self.device);
            state.in_flight = others;
            if state.deferred_cancel {
                state.cancelled.extend(mine.into_iter().map(|(_, t)| t));
                return;
            }
            let events: Vec<HostEvent> = mine
                .into_iter()
                .map(|(_, t)| {
                    HostEvent::TransferCompleted(TransferCompletion::from_transfer(
                        t,
                        TransferStatus::Cancelled,
                        0,
                    ))
                })
                .collect();
            (state.events.clone(), events)
        };
        if let Some(sender) = sender {
            // Called on the dispatch task: never wait on its own queue
            let events_len = events.len();
            std::thread::spawn(move || {
                for event in events {
                    if sender.send_blocking(event).is_err() {
                        break;
                    }
                }
            });
            tracing::trace!("mock host cancelled {} transfers", events_len);
        }
    }

    fn release(self: Box<Self>) {
        let mut state = self.host.lock();
        state
            .claims
            .retain(|(addr, itfs)| !(*addr == self.device && *itfs == self.interfaces));
        state.releases += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::create_host_channel;
    use crate::usb_types::TransferTag;

    fn addr(n: u8) -> DeviceAddress {
        DeviceAddress::new(1, n)
    }

    #[test]
    fn test_create_mock_cdc_acm_arrival() {
        let dev = create_mock_cdc_acm_arrival(addr(3), 0x1234, 0x5678);

        assert_eq!(dev.vendor_id, 0x1234);
        assert_eq!(dev.interfaces.len(), 2);
        assert!(dev.interface(0).unwrap().data_endpoints().is_none());
        let (ep_in, ep_out) = dev.interface(1).unwrap().data_endpoints().unwrap();
        assert_eq!(ep_in.address, 0x81);
        assert_eq!(ep_out.address, 0x02);
    }

    #[test]
    fn test_create_mock_hid_arrival_has_no_stream() {
        let dev = create_mock_hid_arrival(addr(4), 0x046d, 0xc52b);
        assert!(dev.interface(0).unwrap().data_endpoints().is_none());
    }

    #[test]
    fn test_create_mock_bulk_data() {
        let data = create_mock_bulk_data(1024);

        assert_eq!(data.len(), 1024);
        assert_eq!(data[0], 0);
        assert_eq!(data[255], 255);
        assert_eq!(data[256], 0); // Wraps around
    }

    #[test]
    fn test_register_reports_present_devices() {
        let host = MockHost::new();
        host.plug(create_mock_vendor_arrival(addr(2), 1, 2));

        let (tx, rx) = create_host_channel(8);
        host.register_client(tx).unwrap();

        match rx.try_recv() {
            Some(HostEvent::DeviceArrived(dev)) => assert_eq!(dev.address, addr(2)),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(host.is_registered());
        assert_eq!(
            host.register_client(create_host_channel(1).0).unwrap_err(),
            HostError::ClientRegistered
        );
    }

    #[test]
    fn test_claim_submit_complete() {
        let host = MockHost::new();
        let (tx, rx) = create_host_channel(8);
        host.register_client(tx).unwrap();
        host.plug(create_mock_vendor_arrival(addr(2), 1, 2));
        let _ = rx.try_recv();

        let mut link = host.open_interface(addr(2), &[0]).unwrap();
        assert_eq!(
            host.open_interface(addr(2), &[0]).err(),
            Some(HostError::Busy)
        );

        link.submit(Transfer {
            tag: TransferTag(1),
            endpoint: 0x81,
            kind: TransferKind::Bulk,
            buffer: vec![0; 64],
            length: 64,
        })
        .unwrap();
        assert_eq!(host.pending_count(Direction::In), 1);
        assert_eq!(host.complete_in(b"hello"), Some(5));

        match rx.try_recv() {
            Some(HostEvent::TransferCompleted(c)) => {
                assert_eq!(c.tag, TransferTag(1));
                assert_eq!(c.data(), b"hello");
            }
            other => panic!("unexpected event: {:?}", other),
        }

        link.release();
        assert!(host.claims().is_empty());
        assert_eq!(host.release_count(), 1);
    }

    #[test]
    fn test_submit_after_unplug_is_refused() {
        let host = MockHost::new();
        host.plug(create_mock_vendor_arrival(addr(2), 1, 2));
        let mut link = host.open_interface(addr(2), &[0]).unwrap();
        host.unplug(addr(2));

        let refused = link.submit(Transfer {
            tag: TransferTag(9),
            endpoint: 0x01,
            kind: TransferKind::Bulk,
            buffer: vec![1, 2, 3],
            length: 3,
        });
        let (err, transfer) = refused.unwrap_err();
        assert_eq!(err, HostError::NoDevice);
        assert_eq!(transfer.buffer, vec![1, 2, 3]);
    }

    #[test]
    fn test_deferred_cancel() {
        let host = MockHost::new();
        host.set_deferred_cancel(true);
        host.plug(create_mock_vendor_arrival(addr(2), 1, 2));
        let mut link = host.open_interface(addr(2), &[0]).unwrap();
        link.submit(Transfer {
            tag: TransferTag(1),
            endpoint: 0x81,
            kind: TransferKind::Bulk,
            buffer: vec![0; 64],
            length: 64,
        })
        .unwrap();

        link.cancel_all();
        assert_eq!(host.pending_count(Direction::In), 0);
        assert_eq!(host.cancelled_count(), 1);
        assert_eq!(host.finish_cancelled(), 1);
        assert_eq!(host.cancelled_count(), 0);
    }

    #[tokio::test]
    async fn test_with_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        assert!(result.is_err());
    }

    #[test]
    fn test_wait_until() {
        assert!(wait_until(Duration::from_millis(50), || true));
        assert!(!wait_until(Duration::from_millis(10), || false));
    }
}
