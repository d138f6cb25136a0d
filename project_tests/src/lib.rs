//! # Scenario Fixtures
//!
//! Shared pieces for the end-to-end scenarios under `tests/`: an in-memory
//! `Harness`, a channel-backed `TestClient` that stands in for a socket, and
//! collaborators that fail on purpose.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_channel::mpsc;
use futures_util::StreamExt;
use lib_realtime::error::{LimiterError, RealtimeError, StoreError};
use lib_realtime::error::BrokerError;
use lib_realtime::fanout::{
    AccessMode, ChannelBroker, ConnectRequest, Envelope, ItemUpdate, Subscription, TopicRequest,
};
use lib_realtime::limiter::{BucketPolicy, BucketStore};
use lib_realtime::ports::{
    IdentityValidator, MemoryBlobStore, MemoryPersister, Persister, SignedTokenValidator,
};
use lib_realtime::{
    Collaborators, ConnectionGateway, Frame, GatewayConfig, Identity, Item, ItemId, MemoryBroker,
    Topic,
};
use serde_json::Value;
use tokio::task::JoinHandle;

pub const SECRET: &str = "scenario-secret";

/// Smallest byte string the attachment sniffer accepts as PNG.
pub const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D];

const FRAME_DEADLINE: Duration = Duration::from_secs(2);

/// In-memory collaborators with typed handles kept for assertions.
pub struct Harness {
    pub persister: Arc<dyn Persister>,
    pub blobs: Arc<MemoryBlobStore>,
    pub broker: Arc<MemoryBroker>,
    pub tokens: SignedTokenValidator,
}

impl Default for Harness {
    fn default() -> Self {
        Self::with_persister(Arc::new(MemoryPersister::new()))
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persister(persister: Arc<dyn Persister>) -> Self {
        Self {
            persister,
            blobs: Arc::new(MemoryBlobStore::default()),
            broker: Arc::new(MemoryBroker::new()),
            tokens: SignedTokenValidator::new(SECRET),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        let identities: Arc<dyn IdentityValidator> = Arc::new(SignedTokenValidator::new(SECRET));
        Collaborators {
            persister: Arc::clone(&self.persister),
            blobs: self.blobs.clone(),
            identities,
            broker: self.broker.clone(),
        }
    }

    pub fn gateway(&self, config: GatewayConfig) -> ConnectionGateway {
        ConnectionGateway::new(self.collaborators(), config)
    }

    /// Gateway whose subscriptions go through `broker` instead of the shared one.
    pub fn gateway_with_broker(
        &self,
        config: GatewayConfig,
        broker: Arc<dyn ChannelBroker>,
    ) -> ConnectionGateway {
        let collaborators = Collaborators {
            broker,
            ..self.collaborators()
        };
        ConnectionGateway::new(collaborators, config)
    }

    pub fn token(&self, user: &str) -> String {
        self.tokens.issue(&Identity::from(user))
    }

    /// Read/write connection to `post:<post_id>` as `user`.
    pub fn post_request(&self, post_id: &str, user: &str) -> ConnectRequest {
        ConnectRequest {
            credential: Some(self.token(user)),
            target: TopicRequest::Entity {
                kind: "post".into(),
                id: post_id.into(),
            },
            mode: AccessMode::ReadWrite,
            client_key: format!("10.0.0.{}", user.len()),
        }
    }

    /// Connection from `user` to the pair topic shared with `peer`.
    pub fn chat_request(&self, user: &str, peer: &str) -> ConnectRequest {
        ConnectRequest {
            credential: Some(self.token(user)),
            target: TopicRequest::Pair {
                peer: Identity::from(peer),
            },
            mode: AccessMode::ReadWrite,
            client_key: format!("client-{}", user),
        }
    }

    pub async fn history(&self, topic: &Topic) -> Vec<Item> {
        self.persister
            .list_by_topic(topic, 1, 100)
            .await
            .unwrap_or_default()
    }

    /// Waits until the broker holds no topics, or the deadline passes.
    pub async fn wait_for_released_topics(&self) -> bool {
        let deadline = tokio::time::Instant::now() + FRAME_DEADLINE;
        while tokio::time::Instant::now() < deadline {
            if self.broker.topic_count() == 0 {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}

/// The far end of a connection being served by a gateway.
pub struct TestClient {
    tx: Option<mpsc::UnboundedSender<Result<Frame, Infallible>>>,
    rx: mpsc::UnboundedReceiver<Frame>,
    task: JoinHandle<Result<(), RealtimeError>>,
}

impl TestClient {
    pub fn connect(gateway: &ConnectionGateway, request: ConnectRequest) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded();
        let (out_tx, out_rx) = mpsc::unbounded();
        let gateway = gateway.clone();
        let task = tokio::spawn(async move { gateway.serve(request, out_tx, in_rx).await });
        Self {
            tx: Some(in_tx),
            rx: out_rx,
            task,
        }
    }

    fn send(&self, frame: Frame) {
        if let Some(tx) = &self.tx {
            tx.unbounded_send(Ok(frame)).expect("gateway is reading");
        }
    }

    pub fn send_json(&self, body: Value) {
        self.send(Frame::Text(body.to_string()));
    }

    pub fn send_binary(&self, bytes: &[u8]) {
        self.send(Frame::Binary(Bytes::copy_from_slice(bytes)));
    }

    /// Next text frame parsed as JSON. Panics after two seconds of silence.
    pub async fn next_json(&mut self) -> Value {
        let frame = tokio::time::timeout(FRAME_DEADLINE, self.rx.next())
            .await
            .expect("frame within deadline")
            .expect("transport still open");
        match frame {
            Frame::Text(text) => serde_json::from_str(&text).expect("json text frame"),
            other => panic!("expected a text frame, got {:?}", other),
        }
    }

    /// True when nothing arrives within `window`.
    pub async fn stays_quiet(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.rx.next()).await.is_err()
    }

    /// Stops accepting outbound frames; the gateway's next write fails.
    pub fn stop_reading(&mut self) {
        self.rx.close();
    }

    /// Waits for the gateway to finish on its own, inbound side still open.
    pub async fn finished(mut self) -> Result<(), RealtimeError> {
        let _inbound = self.tx.take();
        tokio::time::timeout(FRAME_DEADLINE, self.task)
            .await
            .expect("gateway finished within deadline")
            .expect("gateway task did not panic")
    }

    /// Closes the inbound side and waits for the gateway to finish.
    pub async fn hang_up(mut self) -> Result<(), RealtimeError> {
        self.tx.take();
        tokio::time::timeout(FRAME_DEADLINE, self.task)
            .await
            .expect("gateway finished within deadline")
            .expect("gateway task did not panic")
    }
}

/// Fails `store` a set number of times before delegating.
pub struct FlakyPersister {
    inner: MemoryPersister,
    failures_left: AtomicUsize,
    store_calls: AtomicUsize,
}

impl FlakyPersister {
    pub fn failing(times: usize) -> Self {
        Self {
            inner: MemoryPersister::new(),
            failures_left: AtomicUsize::new(times),
            store_calls: AtomicUsize::new(0),
        }
    }

    pub fn store_calls(&self) -> usize {
        self.store_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Persister for FlakyPersister {
    async fn store(&self, item: &Item) -> Result<ItemId, StoreError> {
        self.store_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("injected failure".into()));
        }
        self.inner.store(item).await
    }

    async fn get(&self, id: &ItemId) -> Result<Item, StoreError> {
        self.inner.get(id).await
    }

    async fn update(&self, id: &ItemId, fields: ItemUpdate) -> Result<(), StoreError> {
        self.inner.update(id, fields).await
    }

    async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        self.inner.delete(id).await
    }

    async fn list_by_topic(
        &self,
        topic: &Topic,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<Item>, StoreError> {
        self.inner.list_by_topic(topic, page, page_size).await
    }
}

/// A bucket store whose backend is always down.
#[derive(Debug, Default)]
pub struct UnreachableBucketStore;

#[async_trait]
impl BucketStore for UnreachableBucketStore {
    async fn refill_and_consume(
        &self,
        _key: &str,
        _policy: &BucketPolicy,
    ) -> Result<bool, LimiterError> {
        Err(LimiterError::Unreachable("connection refused".into()))
    }
}

/// Subscribes through the shared broker, then stalls before handing the
/// subscription back.
pub struct SlowSubscribeBroker {
    inner: Arc<MemoryBroker>,
    delay: Duration,
}

impl SlowSubscribeBroker {
    pub fn new(inner: Arc<MemoryBroker>, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl ChannelBroker for SlowSubscribeBroker {
    async fn publish(&self, topic: &Topic, envelope: &Envelope) -> Result<(), BrokerError> {
        self.inner.publish(topic, envelope).await
    }

    async fn subscribe(&self, topic: &Topic) -> Result<Subscription, BrokerError> {
        let subscription = self.inner.subscribe(topic).await?;
        tokio::time::sleep(self.delay).await;
        Ok(subscription)
    }
}
