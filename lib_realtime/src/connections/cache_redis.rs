//! # Redis Handle
//!
//! Owns the Redis client and one auto-reconnecting multiplexed connection.
//! Pub/sub needs dedicated connections, which are opened from `client`.

use redis::aio::ConnectionManager;
use redis::{Client, RedisResult};

/// A handler for Redis interactions shared by the broker and the limiter.
#[derive(Clone)]
pub struct RedisHandle {
    /// The Redis client, used to open dedicated pub/sub connections.
    pub client: Client,
    manager: ConnectionManager,
}

impl RedisHandle {
    /// Connects to `url` (e.g. "redis://127.0.0.1/").
    pub async fn connect(url: &str) -> RedisResult<Self> {
        let client = Client::open(url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { client, manager })
    }

    /// A clone of the shared multiplexed connection.
    pub fn manager(&self) -> ConnectionManager {
        self.manager.clone()
    }

    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.manager();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
