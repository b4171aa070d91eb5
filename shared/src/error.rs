//! Error types for FdxTunnel.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Status reported to a caller whose call failed for any reason.
pub const FAILURE_STATUS: u16 = 500;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Tunnel error: {0}")]
    Tunnel(String),

    #[error("Decode error: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Encode error: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("connection controller for {0} is not found")]
    TargetNotFound(String),

    #[error("connection controller for {0} already exists")]
    AlreadyRegistered(String),

    #[error("timeout: no data received from {target} within {after:?}")]
    Timeout { target: String, after: Duration },

    #[error("tunnel connection for {0} is closed")]
    ConnectionClosed(String),

    #[error("Forward error: {0}")]
    Forward(String),
}

impl Error {
    /// HTTP-style status code a failed call reports alongside this error.
    pub fn status(&self) -> u16 {
        FAILURE_STATUS
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_message_names_target_and_bound() {
        let err = Error::Timeout {
            target: "t1".into(),
            after: Duration::from_secs(10),
        };
        let msg = err.to_string();
        assert!(msg.contains("t1"));
        assert!(msg.contains("10s"));
        assert!(err.is_timeout());
        assert_eq!(err.status(), 500);
    }

    #[test]
    fn test_not_found_is_not_timeout() {
        let err = Error::TargetNotFound("nobody".into());
        assert!(!err.is_timeout());
        assert_eq!(err.status(), FAILURE_STATUS);
    }
}
