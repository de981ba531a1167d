//! libusb host layer
//!
//! Implements [`common::UsbHost`] with rusb:
//! - Hot-plug registration (with enumeration of devices already present) and
//!   an event pump thread running `handle_events`
//! - Descriptor snapshots taken when a device arrives
//! - Interface claiming with kernel driver detach and re-attach
//! - One worker thread per claimed endpoint executing synchronous transfers
//!   and reporting completions through the host event channel

pub mod device;
pub mod manager;
pub mod transfers;

pub use device::RusbLink;
pub use manager::RusbHost;
