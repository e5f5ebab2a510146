use thiserror::Error;

use crate::codec::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("connect timed out after {0}s")]
    ConnectTimeout(u64),
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
}

/// Last error recorded on a session. None of these end the process.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("network connectivity unavailable")]
    ConnectivityUnavailable,
}
