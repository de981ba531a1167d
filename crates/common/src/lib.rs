//! Common utilities for usbh-cdc
//!
//! This crate provides the pieces shared between the class driver, its host
//! layer backends and the terminal front-end: USB descriptor and transfer
//! types, the host-layer traits, the async channel bridge that carries host
//! events into the driver's dispatch task, error handling and logging setup.

pub mod channel;
pub mod error;
pub mod host;
pub mod logging;
pub mod test_utils;
pub mod usb_types;

pub use channel::{
    DEFAULT_EVENT_QUEUE_DEPTH, HostEvent, HostEventReceiver, HostEventSender, create_host_channel,
};
pub use error::{Error, Result};
pub use host::{HostError, InterfaceLink, UsbHost};
pub use logging::setup_logging;
pub use usb_types::{
    DeviceAddress, DeviceArrival, Direction, EndpointDesc, InterfaceDesc, Transfer,
    TransferCompletion, TransferKind, TransferStatus, TransferTag,
};
