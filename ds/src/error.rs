use fred::error::RedisError;

/// Errors originating from the delivery service layer.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryServiceError {
    #[error("Redis error: {0}")]
    RedisError(#[from] RedisError),
    #[error("Delivery service is shut down")]
    ServiceClosed,
    #[error("Subscriber registry poisoned")]
    RegistryPoisoned,

    #[error("An unknown error occurred: {0}")]
    Other(anyhow::Error),
}
