//! Reliable, deduplicated, at-least-once messaging over an unreliable
//! broadcast pub/sub transport.
//!
//! Layers, bottom up: [`channel`] addresses frames by identity, [`envelope`]
//! adds JSON headers, [`reliable`] tracks confirmation state in a
//! [`cache::MessageCache`] and dead-letters what expires into a
//! [`dead_letter::DeadLetterSink`]. [`driver`] runs the receive/synchronize
//! loop.

pub mod cache;
pub mod channel;
pub mod chat;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod dead_letter;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod message_id;
pub mod reliable;

pub use error::{ChannelError, ReliableError, StorageError};
pub use reliable::{ReliableChannel, ReliableConfig, SyncReport};
