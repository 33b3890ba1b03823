use std::time::Duration;

use clap::{Parser, Subcommand};
use ds::redis::{DEFAULT_PUBSUB_CHANNEL, DEFAULT_REDIS_URL};
use ds::RedisDeliveryConfig;

use crate::config::{CacheBackend, DeadLetterBackend, NodeConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Reliable messaging over a Redis pub/sub channel", long_about = None)]
pub struct Args {
    /// Redis server used for pub/sub and for the Redis-backed stores
    #[arg(long, env = "REDIS_URL", default_value = DEFAULT_REDIS_URL)]
    pub redis_url: String,

    /// Pub/sub channel shared by every participant
    #[arg(long, env = "RELIABLE_CHANNEL", default_value = DEFAULT_PUBSUB_CHANNEL)]
    pub channel: String,

    #[arg(long, value_enum, default_value_t = CacheBackend::OrderedMemory)]
    pub cache: CacheBackend,

    #[arg(long, value_enum, default_value_t = DeadLetterBackend::Memory)]
    pub dead_letters: DeadLetterBackend,

    /// Seconds before an unconfirmed message is dead-lettered (0 = never)
    #[arg(long, default_value_t = 0)]
    pub send_expiry: u64,

    /// Seconds before an owed acknowledgment is dead-lettered (0 = never)
    #[arg(long, default_value_t = 0)]
    pub acknowledge_expiry: u64,

    /// Seconds to keep confirmed sent messages
    #[arg(long)]
    pub retention: Option<u64>,

    /// Milliseconds between two synchronizations
    #[arg(long, default_value_t = 1000)]
    pub tick_ms: u64,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Relay every message from one client to all the others
    Coordinator {
        identity: String,
        #[arg(required = true)]
        clients: Vec<String>,
    },
    /// Send each line read from stdin to the coordinator
    Chat { identity: String, coordinator: String },
}

impl Args {
    pub fn identity(&self) -> &str {
        match &self.command {
            Command::Coordinator { identity, .. } | Command::Chat { identity, .. } => identity,
        }
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            identity: self.identity().to_string(),
            delivery: RedisDeliveryConfig {
                url: self.redis_url.clone(),
                channel: self.channel.clone(),
            },
            cache: self.cache,
            dead_letters: self.dead_letters,
            send_expiry: Duration::from_secs(self.send_expiry),
            acknowledge_expiry: Duration::from_secs(self.acknowledge_expiry),
            retention: self.retention.map(Duration::from_secs),
            tick_interval: Duration::from_millis(self.tick_ms),
        }
    }
}
