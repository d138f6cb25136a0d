//! # Redis Broker
//!
//! Topics map one-to-one onto Redis channels. Publishing goes over the shared
//! multiplexed connection; every subscription gets its own pub/sub connection
//! and a pump task that reopens it after `resubscribe_delay` whenever the
//! stream ends, until the subscription is cancelled. Envelopes published while
//! a pump is reconnecting are lost.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::Client;
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::cache_redis::RedisHandle;
use crate::error::BrokerError;
use crate::fanout::broker::{ChannelBroker, Subscription, SubscriptionHandle, SUBSCRIPTION_BUFFER};
use crate::fanout::envelope::Envelope;
use crate::fanout::topic::Topic;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RedisBrokerConfig {
    /// Pause before reopening a failed subscription.
    pub resubscribe_delay_ms: u64,
}

impl Default for RedisBrokerConfig {
    fn default() -> Self {
        Self {
            resubscribe_delay_ms: 5_000,
        }
    }
}

impl RedisBrokerConfig {
    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_millis(self.resubscribe_delay_ms)
    }
}

#[derive(Clone)]
pub struct RedisBroker {
    client: Client,
    publisher: ConnectionManager,
    config: RedisBrokerConfig,
}

impl RedisBroker {
    pub fn new(handle: &RedisHandle, config: RedisBrokerConfig) -> Self {
        Self {
            client: handle.client.clone(),
            publisher: handle.manager(),
            config,
        }
    }
}

/// Opens a pub/sub connection and waits for the SUBSCRIBE to be confirmed.
async fn open(client: &Client, topic: &Topic) -> Result<PubSub, BrokerError> {
    let mut pubsub = client
        .get_async_pubsub()
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;
    pubsub
        .subscribe(topic.as_str())
        .await
        .map_err(|e| BrokerError::Connection(e.to_string()))?;
    Ok(pubsub)
}

#[async_trait]
impl ChannelBroker for RedisBroker {
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BrokerError> {
        let payload = envelope.encode()?;
        let mut conn = self.publisher.clone();
        let receivers: i64 = redis::cmd("PUBLISH")
            .arg(topic.as_str())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        debug!(topic = %topic, receivers, "published");
        Ok(())
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BrokerError> {
        let mut pubsub = open(&self.client, topic).await?;

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let handle = SubscriptionHandle::new();
        let pump_handle = handle.clone();
        let pump_topic = topic.clone();
        let client = self.client.clone();
        let delay = self.config.resubscribe_delay();

        tokio::spawn(async move {
            loop {
                let mut messages = Box::pin(pubsub.into_on_message());
                loop {
                    let msg = tokio::select! {
                        biased;
                        _ = pump_handle.cancelled() => return,
                        msg = messages.next() => msg,
                    };
                    let Some(msg) = msg else { break };
                    let raw: String = match msg.get_payload() {
                        Ok(raw) => raw,
                        Err(e) => {
                            warn!(
                                topic = %pump_topic,
                                error = %e,
                                "non-text pubsub payload skipped"
                            );
                            continue;
                        }
                    };
                    match Envelope::decode(&raw) {
                        Ok(envelope) => {
                            if tx.send(envelope).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(topic = %pump_topic, error = %e, "undecodable envelope skipped")
                        }
                    }
                }

                warn!(
                    topic = %pump_topic,
                    delay_ms = delay.as_millis() as u64,
                    "pubsub stream ended, resubscribing"
                );
                pubsub = loop {
                    tokio::select! {
                        biased;
                        _ = pump_handle.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                    match open(&client, &pump_topic).await {
                        Ok(p) => break p,
                        Err(e) => warn!(topic = %pump_topic, error = %e, "resubscribe failed"),
                    }
                };
                info!(topic = %pump_topic, "resubscribed");
            }
        });

        Ok(Subscription::new(topic.clone(), rx, handle))
    }
}
