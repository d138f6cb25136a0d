//! # Channel Broker
//!
//! Publish/subscribe over named topics. Delivery is at-most-once, in publish
//! order per topic and per broker connection. Subscribers see only what is
//! published while they are subscribed; history comes from the persister.
//!
//! Every implementation hands out a [`Subscription`]: a bounded receiver fed by
//! a pump task, plus a cancellation handle that stops the pump. Cancelling is
//! idempotent and may happen from any task.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::envelope::Envelope;
use super::topic::Topic;
use crate::error::BrokerError;

pub mod memory;

pub use memory::MemoryBroker;

/// Buffer between a broker pump and its subscriber.
pub const SUBSCRIPTION_BUFFER: usize = 256;

#[async_trait]
pub trait ChannelBroker: Send + Sync {
    /// Sends `envelope` to every current subscriber of `topic`. Fire-and-forget.
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BrokerError>;

    /// Opens a live stream of envelopes for `topic`. Once this returns, every
    /// later publish on the topic is delivered to the subscription.
    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BrokerError>;
}

/// Releases a subscription. Cheap to clone; cancelling twice is a no-op.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionHandle {
    token: CancellationToken,
}

impl SubscriptionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

/// A live stream of envelopes for one topic. Dropping it cancels it.
#[derive(Debug)]
pub struct Subscription {
    topic: Topic,
    rx: mpsc::Receiver<Envelope>,
    handle: SubscriptionHandle,
}

impl Subscription {
    /// Pairs a receiver with the handle its pump watches.
    pub fn new(topic: Topic, rx: mpsc::Receiver<Envelope>, handle: SubscriptionHandle) -> Self {
        Self { topic, rx, handle }
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Next envelope, or `None` once cancelled or the pump has stopped.
    pub async fn recv(&mut self) -> Option<Envelope> {
        if self.handle.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.handle.cancelled() => None,
            msg = self.rx.recv() => msg,
        }
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    pub fn cancel(&self) {
        self.handle.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
