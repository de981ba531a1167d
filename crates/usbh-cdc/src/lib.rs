//! USB host CDC byte-stream driver
//!
//! Turns the bulk (or interrupt) endpoint pair of a serial-like USB
//! peripheral into buffered, non-blocking reads and writes.
//!
//! Architecture:
//! - A dispatch task on its own thread consumes host events (arrival,
//!   removal, transfer completion) and application commands, and owns every
//!   device state transition.
//! - Each device has an RX and a TX [`pipe::Pipe`]: lock-free byte rings that
//!   decouple transfer completion from application I/O.
//! - The transfer scheduler keeps a bounded set of transfers in flight per
//!   direction, sized to the space (or data) in the pipes.
//! - The host layer is abstracted by [`common::UsbHost`]; [`usb::RusbHost`]
//!   implements it on top of libusb.

pub mod config;
pub mod device;
pub mod driver;
pub mod error;
pub mod pipe;
mod placement;
mod registry;
mod scheduler;
pub mod usb;
mod worker;

pub use config::{DeviceConfig, DriverConfig, NewDeviceCallback};
pub use device::{
    DeviceHandle, DeviceIdentity, DeviceState, EventCallback, EventCallbacks, LinkState, UserData,
};
pub use driver::CdcDriver;
pub use error::{Error, ErrorKind, Result};
pub use registry::MAX_DEVICES;
pub use usb::RusbHost;
