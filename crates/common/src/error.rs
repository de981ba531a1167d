//! Errors of the shared plumbing (event channel, logging setup)
//!
//! Host-layer failures have their own type, [`HostError`](crate::HostError),
//! because they cross the driver boundary by value.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// The other end of the host event channel is gone
    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Channel("receiving on a closed channel".to_string());
        assert_eq!(err.to_string(), "Channel error: receiving on a closed channel");
        assert!(
            Error::Config("bad filter".to_string())
                .to_string()
                .starts_with("Configuration error")
        );
    }
}
