//! Transfer scheduling between the pipes and a claimed interface
//!
//! A [`Link`] owns the claimed [`InterfaceLink`] of one connected device and
//! its transfer slots. Each slot owns a staging buffer; submitting a transfer
//! moves that buffer into the host layer and the completion hands it back.
//! A slot whose buffer is away is in flight.
//!
//! RX keeps IN transfers queued for as much pipe space as is free, minus what
//! in-flight transfers already reserved, so a completion can always be pushed
//! in full. TX peeks bytes out of the pipe into a slot and consumes them only
//! once the host accepted the transfer.

use crate::device::{Device, DeviceHandle, SlotConfig};
use crate::error::{Error, Result};
use common::{
    Direction, EndpointDesc, HostError, InterfaceLink, Transfer, TransferCompletion,
    TransferStatus, TransferTag,
};
use tracing::{trace, warn};

/// Endpoints and interfaces a device moves its byte stream over
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataPath {
    /// Interfaces to claim; the data interface is last
    pub interfaces: Vec<u8>,
    pub ep_in: EndpointDesc,
    pub ep_out: EndpointDesc,
}

const TAG_DIR_IN: u64 = 0x80;
const TAG_SLOT_MASK: u64 = 0x7F;

/// Pack the owner and slot of a transfer into its tag
pub(crate) fn encode_tag(handle: DeviceHandle, direction: Direction, slot: usize) -> TransferTag {
    let dir = match direction {
        Direction::In => TAG_DIR_IN,
        Direction::Out => 0,
    };
    TransferTag(
        (u64::from(handle.index & 0x00FF_FFFF) << 40)
            | (u64::from(handle.generation) << 8)
            | dir
            | (slot as u64 & TAG_SLOT_MASK),
    )
}

pub(crate) fn decode_tag(tag: TransferTag) -> (DeviceHandle, Direction, usize) {
    let handle = DeviceHandle {
        index: (tag.0 >> 40) as u32,
        generation: (tag.0 >> 8) as u32,
    };
    let direction = if tag.0 & TAG_DIR_IN != 0 {
        Direction::In
    } else {
        Direction::Out
    };
    (handle, direction, (tag.0 & TAG_SLOT_MASK) as usize)
}

/// Fixed set of staging buffers; `None` marks a slot in flight
struct SlotPool {
    slots: Vec<Option<Vec<u8>>>,
}

impl SlotPool {
    fn new(count: usize, buffer_size: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(count)
            .map_err(|_| Error::OutOfMemory)?;
        for _ in 0..count {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(buffer_size)
                .map_err(|_| Error::OutOfMemory)?;
            buffer.resize(buffer_size, 0);
            slots.push(Some(buffer));
        }
        Ok(Self { slots })
    }

    fn take_idle(&mut self) -> Option<(usize, Vec<u8>)> {
        self.slots
            .iter_mut()
            .enumerate()
            .find_map(|(i, slot)| slot.take().map(|buffer| (i, buffer)))
    }

    /// Give a buffer back to its slot; false if the slot was not in flight
    fn restore(&mut self, slot: usize, buffer: Vec<u8>) -> bool {
        match self.slots.get_mut(slot) {
            Some(entry @ None) => {
                *entry = Some(buffer);
                true
            }
            _ => false,
        }
    }

    fn in_flight(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_none()).count()
    }
}

/// What a completion did to the device
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionOutcome {
    /// Bytes pushed into the RX pipe
    pub received: usize,
    /// The link can no longer be used
    pub fatal: bool,
}

pub(crate) struct Link {
    iface: Box<dyn InterfaceLink>,
    path: DataPath,
    handle: DeviceHandle,
    rx_slots: SlotPool,
    tx_slots: SlotPool,
    /// Pipe space promised to in-flight IN transfers
    rx_reserved: usize,
    rx_requested: Vec<usize>,
    /// Largest IN request; never below one packet
    rx_limit: usize,
    transfer_size: usize,
    cancelling: bool,
}

impl Link {
    /// Allocate the slot buffers; the interface is released if that fails
    pub fn new(
        iface: Box<dyn InterfaceLink>,
        path: DataPath,
        handle: DeviceHandle,
        slots: SlotConfig,
    ) -> Result<Self> {
        let packet = usize::from(path.ep_in.max_packet_size.max(path.ep_out.max_packet_size));
        let staging = slots.transfer_size.max(packet);
        let in_packet = usize::from(path.ep_in.max_packet_size).max(1);
        let rx_limit = (slots.transfer_size - slots.transfer_size % in_packet).max(in_packet);
        let pools = SlotPool::new(slots.rx_transfers, staging)
            .and_then(|rx| Ok((rx, SlotPool::new(slots.tx_transfers, staging)?)));
        let (rx_slots, tx_slots) = match pools {
            Ok(pools) => pools,
            Err(e) => {
                iface.release();
                return Err(e);
            }
        };

        Ok(Self {
            rx_slots,
            tx_slots,
            rx_requested: vec![0; slots.rx_transfers],
            rx_reserved: 0,
            rx_limit,
            transfer_size: slots.transfer_size,
            cancelling: false,
            iface,
            path,
            handle,
        })
    }

    pub fn path(&self) -> &DataPath {
        &self.path
    }

    /// Length of the next IN transfer, 0 if there is no room for one
    fn next_rx_length(&self, device: &Device) -> usize {
        let free = device.rx.free_space().saturating_sub(self.rx_reserved);
        let packet = usize::from(self.path.ep_in.max_packet_size).max(1);
        let length = free.min(self.rx_limit);
        let rounded = length - length % packet;

        if rounded == 0 && self.rx_reserved == 0 && device.rx.capacity() < packet {
            // The pipe can never hold a full packet; ask for what fits
            return length;
        }
        rounded
    }

    /// Submit every transfer the pipes currently allow
    ///
    /// An error means the host refused a submission and the link is unusable.
    pub fn service(&mut self, device: &Device) -> std::result::Result<(), HostError> {
        if self.cancelling {
            return Ok(());
        }
        self.fill_rx(device)?;
        self.drain_tx(device)
    }

    fn fill_rx(&mut self, device: &Device) -> std::result::Result<(), HostError> {
        loop {
            let length = self.next_rx_length(device);
            if length == 0 {
                return Ok(());
            }
            let Some((slot, buffer)) = self.rx_slots.take_idle() else {
                return Ok(());
            };
            let length = length.min(buffer.len());

            let transfer = Transfer {
                tag: encode_tag(self.handle, Direction::In, slot),
                endpoint: self.path.ep_in.address,
                kind: self.path.ep_in.kind,
                buffer,
                length,
            };
            if let Err((err, transfer)) = self.iface.submit(transfer) {
                self.rx_slots.restore(slot, transfer.buffer);
                return Err(err);
            }

            self.rx_reserved += length;
            self.rx_requested[slot] = length;
            trace!("Device {} queued IN {} bytes (slot {})", self.handle, length, slot);
        }
    }

    fn drain_tx(&mut self, device: &Device) -> std::result::Result<(), HostError> {
        while !device.tx.is_empty() {
            let Some((slot, mut buffer)) = self.tx_slots.take_idle() else {
                return Ok(());
            };
            let limit = self.transfer_size.min(buffer.len());
            let mark = device.tx.peek(&mut buffer[..limit]);
            if mark.is_empty() {
                self.tx_slots.restore(slot, buffer);
                return Ok(());
            }

            let transfer = Transfer {
                tag: encode_tag(self.handle, Direction::Out, slot),
                endpoint: self.path.ep_out.address,
                kind: self.path.ep_out.kind,
                buffer,
                length: mark.len(),
            };
            if let Err((err, transfer)) = self.iface.submit(transfer) {
                self.tx_slots.restore(slot, transfer.buffer);
                return Err(err);
            }

            if !device.tx.commit(mark) {
                // Flushed while the bytes were being handed over; they still go out
                trace!("Device {} TX flushed during submission", self.handle);
            }
            trace!("Device {} queued OUT {} bytes (slot {})", self.handle, mark.len(), slot);
        }
        Ok(())
    }

    /// Take a completed transfer back
    pub fn on_completion(
        &mut self,
        device: &Device,
        completion: TransferCompletion,
        direction: Direction,
        slot: usize,
    ) -> CompletionOutcome {
        let mut outcome = CompletionOutcome {
            received: 0,
            fatal: completion.status.is_fatal(),
        };

        match direction {
            Direction::In => {
                let requested = self.rx_requested.get(slot).copied().unwrap_or(0);
                if completion.status == TransferStatus::Completed {
                    let data = completion.data();
                    let data = &data[..data.len().min(requested)];
                    outcome.received = device.rx.push(data);
                    if outcome.received < data.len() {
                        warn!(
                            "Device {} dropped {} received bytes",
                            self.handle,
                            data.len() - outcome.received
                        );
                    }
                }
                if self.rx_slots.restore(slot, completion.buffer) {
                    self.rx_reserved = self.rx_reserved.saturating_sub(requested);
                    self.rx_requested[slot] = 0;
                } else {
                    warn!("Device {} got completion for idle RX slot {}", self.handle, slot);
                }
            }
            Direction::Out => {
                if !self.tx_slots.restore(slot, completion.buffer) {
                    warn!("Device {} got completion for idle TX slot {}", self.handle, slot);
                }
            }
        }

        match &completion.status {
            TransferStatus::Completed | TransferStatus::Cancelled => {}
            TransferStatus::TimedOut => {
                warn!("Device {} {:?} transfer timed out", self.handle, direction);
            }
            status => {
                warn!("Device {} {:?} transfer failed: {:?}", self.handle, direction, status);
            }
        }
        trace!(
            "Device {} {:?} completion {:?}, {} bytes",
            self.handle, direction, completion.status, completion.actual_length
        );
        outcome
    }

    /// Cancel everything in flight; no transfer is submitted afterwards
    pub fn cancel(&mut self) {
        if !self.cancelling {
            self.cancelling = true;
            self.iface.cancel_all();
        }
    }

    pub fn is_cancelling(&self) -> bool {
        self.cancelling
    }

    /// No buffer is held by the host layer
    pub fn is_quiescent(&self) -> bool {
        self.rx_slots.in_flight() == 0 && self.tx_slots.in_flight() == 0
    }

    pub fn in_flight(&self) -> (usize, usize) {
        (self.rx_slots.in_flight(), self.tx_slots.in_flight())
    }

    /// Hand the interfaces back to the host layer
    pub fn release(self) {
        self.iface.release();
    }
}
