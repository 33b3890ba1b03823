use std::string::FromUtf8Error;

use ds::DeliveryServiceError;
use fred::error::RedisError;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error(transparent)]
    DeliveryServiceError(#[from] DeliveryServiceError),
    #[error("Transport subscription closed")]
    TransportClosed,

    #[error("Frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] FromUtf8Error),
    #[error("Frame is not a valid envelope: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

impl ChannelError {
    /// Whether the error concerns a single malformed frame rather than the
    /// transport itself. Such frames are dropped; the loop carries on.
    pub fn is_decode_error(&self) -> bool {
        matches!(
            self,
            ChannelError::InvalidUtf8(_) | ChannelError::InvalidJson(_)
        )
    }
}

/// Errors raised by message cache and dead-letter backends.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(#[from] RedisError),
    #[error("JSON processing error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("Unknown message: {0}")]
    UnknownMessage(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ReliableError {
    #[error(transparent)]
    ChannelError(#[from] ChannelError),
    #[error(transparent)]
    StorageError(#[from] StorageError),
}
