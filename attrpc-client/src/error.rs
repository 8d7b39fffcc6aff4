//! Client error types.

use crate::config::ConfigError;
use attrpc_link::{LinkError, ProtocolError, TransportError};
use attrpc_protocol::FramingError;
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("request timeout")]
    Timeout,

    #[error("not connected")]
    NotConnected,

    #[error("session broken by an earlier transport failure")]
    SessionBroken,

    #[error("asynchronous delivery not enabled on the link")]
    DeliveryNotEnabled,

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<LinkError> for ClientError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Transport(e) => ClientError::Transport(e),
            LinkError::Protocol(e) => ClientError::Protocol(e),
            LinkError::Timeout => ClientError::Timeout,
            LinkError::NotConnected => ClientError::NotConnected,
            LinkError::DeliveryNotEnabled => ClientError::DeliveryNotEnabled,
            LinkError::PayloadTooLarge { size, max } => ClientError::PayloadTooLarge { size, max },
        }
    }
}

impl ClientError {
    /// Returns whether the session must be reconnected.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ClientError::Transport(_) | ClientError::NotConnected | ClientError::SessionBroken
        )
    }

    /// Returns whether the same request may be sent again on this session.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Timeout | ClientError::Framing(_) | ClientError::Protocol(_)
        )
    }
}
