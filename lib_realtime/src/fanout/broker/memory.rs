//! # In-process Broker
//!
//! One `tokio::sync::broadcast` channel per topic, created on first subscribe
//! and dropped when its last subscriber goes away. Suitable for a single
//! instance; several instances need a shared broker such as Redis.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use super::{ChannelBroker, Subscription, SubscriptionHandle, SUBSCRIPTION_BUFFER};
use crate::error::BrokerError;
use crate::fanout::envelope::Envelope;
use crate::fanout::topic::Topic;

const TOPIC_CAPACITY: usize = 1024;

type TopicTable = HashMap<Topic, broadcast::Sender<Envelope>>;
type Topics = Arc<Mutex<TopicTable>>;

#[derive(Clone, Default)]
pub struct MemoryBroker {
    topics: Topics,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of topics with at least one live subscriber.
    pub fn topic_count(&self) -> usize {
        self.topics.lock().map(|t| t.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, TopicTable>, BrokerError> {
        self.topics
            .lock()
            .map_err(|_| BrokerError::Connection("topic table lock poisoned".into()))
    }
}

#[async_trait]
impl ChannelBroker for MemoryBroker {
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BrokerError> {
        let topics = self.lock()?;
        if let Some(tx) = topics.get(topic) {
            // No receivers is not an error: nobody is listening right now.
            let delivered = tx.send(envelope.clone()).unwrap_or(0);
            debug!(topic = %topic, delivered, "published");
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BrokerError> {
        let mut source = {
            let mut topics = self.lock()?;
            topics
                .entry(topic.clone())
                .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
                .subscribe()
        };

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let handle = SubscriptionHandle::new();
        let pump_handle = handle.clone();
        let pump_topic = topic.clone();
        let topics = Arc::clone(&self.topics);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = pump_handle.cancelled() => break,
                    msg = source.recv() => match msg {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(
                                topic = %pump_topic,
                                missed,
                                "subscriber lagged, envelopes dropped"
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
            drop(source);

            if let Ok(mut topics) = topics.lock() {
                if topics.get(&pump_topic).is_some_and(|s| s.receiver_count() == 0) {
                    topics.remove(&pump_topic);
                    debug!(topic = %pump_topic, "last subscriber left, topic released");
                }
            }
        });

        Ok(Subscription::new(topic.clone(), rx, handle))
    }
}
