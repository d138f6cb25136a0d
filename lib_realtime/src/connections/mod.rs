//! # Connections Module
//!
//! Adapters for the shared services that let several server instances act as
//! one: Redis pub/sub for fan-out and Redis hashes for token buckets.

/// Redis client and multiplexed connection handle.
pub mod cache_redis;

/// `ChannelBroker` over Redis `PUBLISH` / `SUBSCRIBE`.
pub mod redis_broker;

/// `BucketStore` running refill-and-consume as a Lua script.
pub mod redis_bucket;

pub use cache_redis::RedisHandle;
pub use redis_broker::{RedisBroker, RedisBrokerConfig};
pub use redis_bucket::RedisBucketStore;
