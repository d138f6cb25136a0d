//! # Fan-out Core
//!
//! Topic derivation, the item model, the broker abstraction, per-connection
//! message assembly and the connection gateway that ties them together.

pub mod actions;
pub mod assembler;
pub mod broker;
pub mod envelope;
pub mod gateway;
pub mod model;
pub mod reactions;
pub mod sniff;
pub mod topic;

pub use actions::{HistoryQuery, ItemActions};
pub use assembler::{FrameOutcome, MessageAssembler};
pub use broker::{ChannelBroker, MemoryBroker, Subscription, SubscriptionHandle};
pub use envelope::{Action, Envelope, Frame, Stamper};
pub use gateway::{AccessMode, ConnectRequest, ConnectionGateway, GatewayConfig, TopicRequest};
pub use model::{AttachmentRef, InboundText, Item, ItemUpdate, PendingItem, Reactions};
pub use topic::{Identity, ItemId, Topic};
