//! Delivery services: the unreliable broadcast transports the reliable
//! channel is layered on.

mod error;
pub mod memory;
pub mod redis;
pub mod transport;

pub use error::DeliveryServiceError;
pub use memory::{LossFilter, MemoryDeliveryService};
pub use redis::{RedisDeliveryConfig, RedisDeliveryService};
pub use transport::DeliveryService;
