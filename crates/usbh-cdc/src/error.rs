//! Driver error types

use common::HostError;
use thiserror::Error;

/// Errors returned by the driver API
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("driver is not installed")]
    NotInstalled,

    #[error("driver is already installed")]
    AlreadyInstalled,

    #[error("a device with the same vendor, product and interface is already registered")]
    AlreadyExists,

    #[error("out of memory")]
    OutOfMemory,

    #[error("timed out waiting for the dispatch task")]
    Timeout,

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("host layer error: {0}")]
    Host(#[from] HostError),
}

/// Coarse error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    InvalidState,
    AlreadyExists,
    OutOfMemory,
    Timeout,
    Unavailable,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::InvalidState(_) | Error::NotInstalled => ErrorKind::InvalidState,
            Error::AlreadyInstalled | Error::AlreadyExists => ErrorKind::AlreadyExists,
            Error::OutOfMemory => ErrorKind::OutOfMemory,
            Error::Timeout => ErrorKind::Timeout,
            Error::Unavailable(_) | Error::Host(_) => ErrorKind::Unavailable,
        }
    }

    pub(crate) fn invalid_handle(handle: impl std::fmt::Display) -> Self {
        Error::InvalidArgument(format!("unknown device handle {}", handle))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        assert_eq!(Error::NotInstalled.kind(), ErrorKind::InvalidState);
        assert_eq!(Error::AlreadyInstalled.kind(), ErrorKind::AlreadyExists);
        assert_eq!(
            Error::Host(HostError::Busy).kind(),
            ErrorKind::Unavailable
        );
    }

    #[test]
    fn test_error_display() {
        let msg = format!("{}", Error::invalid_handle("#3.1"));
        assert!(msg.contains("unknown device handle #3.1"));
    }
}
