//! USB type abstractions shared by the host layer and the class driver
//!
//! These types describe a physical device the way the host transfer layer
//! reports it (a descriptor snapshot taken at arrival), and the transfers the
//! driver hands back to the host layer.

use std::fmt;

/// Interface class code for CDC communications interfaces
pub const CLASS_CDC_COMM: u8 = 0x02;

/// Interface class code for CDC data interfaces
pub const CLASS_CDC_DATA: u8 = 0x0A;

/// Bit 7 of an endpoint address is set for IN (device to host) endpoints
pub const ENDPOINT_DIR_IN: u8 = 0x80;

/// Location of a physical device on the host (bus number, device address)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress {
    pub bus: u8,
    pub address: u8,
}

impl DeviceAddress {
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}:{:03}", self.bus, self.address)
    }
}

/// Transfer type of a data endpoint
///
/// Control and isochronous endpoints never carry the byte stream and are
/// dropped when a descriptor snapshot is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferKind {
    Bulk,
    Interrupt,
}

/// Direction of a transfer relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Device to host
    In,
    /// Host to device
    Out,
}

impl Direction {
    /// Direction encoded in an endpoint address
    pub fn of_endpoint(endpoint: u8) -> Self {
        if endpoint & ENDPOINT_DIR_IN != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

/// Endpoint descriptor summary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDesc {
    pub address: u8,
    pub kind: TransferKind,
    pub max_packet_size: u16,
}

impl EndpointDesc {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.address)
    }
}

/// Interface descriptor summary (alternate setting 0)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDesc {
    pub number: u8,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub endpoints: Vec<EndpointDesc>,
}

impl InterfaceDesc {
    /// First IN and first OUT endpoint of the same transfer kind, bulk preferred
    pub fn data_endpoints(&self) -> Option<(EndpointDesc, EndpointDesc)> {
        [TransferKind::Bulk, TransferKind::Interrupt]
            .into_iter()
            .find_map(|kind| {
                let find = |dir: Direction| {
                    self.endpoints
                        .iter()
                        .find(|ep| ep.kind == kind && ep.direction() == dir)
                        .copied()
                };
                Some((find(Direction::In)?, find(Direction::Out)?))
            })
    }
}

/// Descriptor snapshot of a physical device, taken when it arrives
///
/// This is all the driver (and the new-device callback) ever sees of a
/// device before claiming one of its interfaces.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceArrival {
    pub address: DeviceAddress,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub protocol: u8,
    pub interfaces: Vec<InterfaceDesc>,
}

impl DeviceArrival {
    pub fn interface(&self, number: u8) -> Option<&InterfaceDesc> {
        self.interfaces.iter().find(|itf| itf.number == number)
    }
}

/// Opaque value the driver attaches to a transfer and gets back on completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferTag(pub u64);

/// A transfer handed to the host layer
///
/// The buffer is owned by the transfer while it is in flight and comes back
/// with the completion. For IN transfers `length` bytes are requested; for OUT
/// transfers the first `length` bytes of `buffer` are sent.
#[derive(Debug)]
pub struct Transfer {
    pub tag: TransferTag,
    pub endpoint: u8,
    pub kind: TransferKind,
    pub buffer: Vec<u8>,
    pub length: usize,
}

impl Transfer {
    pub fn direction(&self) -> Direction {
        Direction::of_endpoint(self.endpoint)
    }
}

/// Final status of a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Completed,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
    TimedOut,
    Error(String),
}

impl TransferStatus {
    /// Whether this status means the link to the device can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Stall
                | TransferStatus::NoDevice
                | TransferStatus::Overflow
                | TransferStatus::Error(_)
        )
    }
}

/// Completion of a transfer, reported by the host layer
#[derive(Debug)]
pub struct TransferCompletion {
    pub tag: TransferTag,
    pub endpoint: u8,
    pub status: TransferStatus,
    pub buffer: Vec<u8>,
    pub actual_length: usize,
}

impl TransferCompletion {
    /// Complete a transfer, keeping its buffer
    pub fn from_transfer(transfer: Transfer, status: TransferStatus, actual_length: usize) -> Self {
        Self {
            tag: transfer.tag,
            endpoint: transfer.endpoint,
            status,
            buffer: transfer.buffer,
            actual_length,
        }
    }

    /// Bytes actually transferred
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.actual_length.min(self.buffer.len())]
    }
}
