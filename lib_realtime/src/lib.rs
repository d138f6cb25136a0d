//! # lib_realtime
//!
//! Real-time fan-out of topic streams (post comment streams, two-party
//! conversations) and distributed token-bucket admission control.
//!
//! ## Modules
//!
//! - **`fanout`**: topic derivation, the published `Envelope`, the
//!   `ChannelBroker` abstraction, the per-connection `MessageAssembler`, the
//!   `ConnectionGateway` that runs a live connection, and `ItemActions` for
//!   request-path mutations.
//! - **`limiter`**: the `RateLimiter` and its bucket stores.
//! - **`ports`**: the collaborator interfaces this crate consumes (persistence,
//!   blob storage, identity validation) plus in-memory adapters.
//! - **`connections`** (feature `connections`): Redis-backed broker and bucket store.
//! - **`loggers`** (feature `loggers`): tracing subscriber setup.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod error;
pub mod fanout;
pub mod limiter;
pub mod ports;

#[cfg(feature = "connections")]
pub mod connections;

#[cfg(feature = "loggers")]
pub mod loggers;

// Re-export the types most callers need.
pub use error::{RealtimeError, ValidationError};
pub use fanout::{
    Action, ChannelBroker, ConnectionGateway, Envelope, Frame, GatewayConfig, Identity, Item,
    ItemActions, ItemId, MemoryBroker, MessageAssembler, Topic,
};
pub use limiter::{BucketPolicy, RateLimiter};
pub use ports::Collaborators;
