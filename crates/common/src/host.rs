//! Host transfer layer interface
//!
//! The class driver consumes the USB host stack through these two traits:
//! [`UsbHost`] for library bring-up, client registration and interface
//! claiming, and [`InterfaceLink`] for asynchronous transfer submission on a
//! claimed interface. Everything the host layer reports back travels as a
//! [`HostEvent`](crate::HostEvent) through the sender passed to
//! [`UsbHost::register_client`].

use crate::channel::HostEventSender;
use crate::usb_types::{DeviceAddress, Transfer};
use thiserror::Error;

/// Errors reported by the host layer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostError {
    #[error("host library is not installed")]
    NotInstalled,

    #[error("a client is already registered")]
    ClientRegistered,

    #[error("no client is registered")]
    NoClient,

    #[error("device {0} not found")]
    DeviceNotFound(DeviceAddress),

    #[error("interface {interface} not found on device {device}")]
    InterfaceNotFound { device: DeviceAddress, interface: u8 },

    #[error("access denied")]
    Access,

    #[error("resource busy")]
    Busy,

    #[error("device is gone")]
    NoDevice,

    #[error("endpoint {0:#04x} is not usable")]
    InvalidEndpoint(u8),

    #[error("{0}")]
    Other(String),
}

/// USB host transfer layer
///
/// Implementations must be cheap to share between the driver and the
/// application; all methods take `&self`.
pub trait UsbHost: Send + Sync + 'static {
    /// Bring up the host library (event pump, controller, ...)
    fn install(&self) -> Result<(), HostError>;

    /// Tear down the host library
    fn uninstall(&self) -> Result<(), HostError>;

    /// Register the driver as the host client
    ///
    /// Arrival of devices already present is reported through `events` as if
    /// they had just been plugged in.
    fn register_client(&self, events: HostEventSender) -> Result<(), HostError>;

    /// Drop the client registration; no events are sent afterwards
    fn deregister_client(&self) -> Result<(), HostError>;

    /// Open `device` and claim `interfaces`
    ///
    /// The returned link is the only way to move data; releasing it returns
    /// the interfaces to the system.
    fn open_interface(
        &self,
        device: DeviceAddress,
        interfaces: &[u8],
    ) -> Result<Box<dyn InterfaceLink>, HostError>;
}

/// A claimed interface on a physical device
pub trait InterfaceLink: Send {
    /// Queue a transfer without blocking
    ///
    /// On success the host layer owns the transfer until it reports a
    /// completion. On refusal the transfer is handed back untouched.
    fn submit(&mut self, transfer: Transfer) -> Result<(), (HostError, Transfer)>;

    /// Cancel every queued and in-flight transfer
    ///
    /// Each cancelled transfer still produces a completion.
    fn cancel_all(&mut self);

    /// Release the claimed interfaces and close the device
    fn release(self: Box<Self>);
}
