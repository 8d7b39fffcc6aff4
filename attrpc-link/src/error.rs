//! Link error types.

use std::io;
use thiserror::Error;

/// Failures of the underlying channel. Fatal to the session: the link must
/// be torn down and a new one connected.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    #[error("connection refused by {0}")]
    ConnectionRefused(String),

    #[error("socket error: {0}")]
    Socket(#[source] io::Error),

    #[error("failed to bind local adapter: {0}")]
    Bind(#[source] io::Error),

    #[error("bluetooth daemon call failed: {0}")]
    DaemonCall(String),
}

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::DaemonCall(err.to_string())
    }
}

/// Attribute protocol violations. Fail the current operation only.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unexpected opcode: expected {expected:#04x}, got {actual:#04x}")]
    OpcodeMismatch { expected: u8, actual: u8 },

    #[error("peer rejected request {request:#04x} on handle {handle:#06x} with error {code:#04x}")]
    ErrorResponse { request: u8, handle: u16, code: u8 },

    #[error("malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("no client characteristic configuration descriptor after handle {0:#06x}")]
    DescriptorNotFound(u16),
}

/// Errors returned by [`crate::Link`] operations.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("link operation timed out")]
    Timeout,

    #[error("link not connected")]
    NotConnected,

    #[error("asynchronous delivery not enabled")]
    DeliveryNotEnabled,

    #[error("payload too large: {size} bytes (unit {max})")]
    PayloadTooLarge { size: usize, max: usize },
}

impl From<bluer::Error> for LinkError {
    fn from(err: bluer::Error) -> Self {
        LinkError::Transport(err.into())
    }
}

impl LinkError {
    /// Returns whether the link is unusable after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LinkError::Transport(_) | LinkError::NotConnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(LinkError::from(TransportError::DeviceNotFound("x".into())).is_fatal());
        assert!(LinkError::NotConnected.is_fatal());

        assert!(!LinkError::Timeout.is_fatal());
        assert!(!LinkError::DeliveryNotEnabled.is_fatal());
        assert!(!LinkError::PayloadTooLarge { size: 30, max: 20 }.is_fatal());
        assert!(!LinkError::from(ProtocolError::MalformedPdu("short".into())).is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = ProtocolError::OpcodeMismatch {
            expected: 0x13,
            actual: 0x0b,
        };
        let msg = err.to_string();
        assert!(msg.contains("0x13"));
        assert!(msg.contains("0x0b"));

        let err = ProtocolError::ErrorResponse {
            request: 0x12,
            handle: 0x002a,
            code: 0x03,
        };
        assert!(err.to_string().contains("0x002a"));

        let err = LinkError::PayloadTooLarge { size: 30, max: 20 };
        assert!(err.to_string().contains("30"));
    }
}
