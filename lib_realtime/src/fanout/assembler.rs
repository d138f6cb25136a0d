//! # Message Assembler
//!
//! Builds one item out of one or more inbound frames on a single connection.
//! Two states: no pending item (Empty) or a `PendingItem` being filled
//! (Accumulating). Only the connection's reader loop touches it, so it needs
//! no locking.
//!
//! Commit rule: a JSON text frame completes the item, carrying whatever
//! attachments earlier binary frames staged. With `commit_on_attachment` set,
//! a binary frame completes it on its own as well.
//!
//! Failure rules:
//! - persist failure: nothing published, pending item kept so the next frame
//!   retries it;
//! - bad parent reference: pending item discarded, its uploads released;
//! - unsupported attachment or empty content: reported, pending item kept.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::envelope::{Action, Envelope, Stamper};
use super::model::{InboundText, Item, PendingItem};
use super::sniff;
use super::topic::{Identity, ItemId, Topic};
use crate::error::{BrokerError, RealtimeError, StoreError, ValidationError};
use crate::ports::Collaborators;

/// What a frame did to the pending item.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Accumulating,
    Completed(Item),
}

pub struct MessageAssembler {
    topic: Topic,
    author: Identity,
    origin: String,
    pending: Option<PendingItem>,
    collaborators: Collaborators,
    stamper: Arc<Stamper>,
    commit_on_attachment: bool,
}

impl MessageAssembler {
    /// `origin` tags published envelopes, normally the connection id.
    pub fn new(
        topic: Topic,
        author: Identity,
        origin: impl Into<String>,
        collaborators: Collaborators,
        stamper: Arc<Stamper>,
    ) -> Self {
        Self {
            topic,
            author,
            origin: origin.into(),
            pending: None,
            collaborators,
            stamper,
            commit_on_attachment: false,
        }
    }

    pub fn with_commit_on_attachment(mut self, eager: bool) -> Self {
        self.commit_on_attachment = eager;
        self
    }

    pub fn pending(&self) -> Option<&PendingItem> {
        self.pending.as_ref()
    }

    fn pending_mut(&mut self) -> &mut PendingItem {
        let (topic, author) = (&self.topic, &self.author);
        self.pending
            .get_or_insert_with(|| PendingItem::new(topic.clone(), author.clone()))
    }

    /// Merges a JSON text frame and tries to complete the item.
    pub async fn accept_text(&mut self, raw: &str) -> Result<FrameOutcome, RealtimeError> {
        let inbound: InboundText =
            serde_json::from_str(raw).map_err(|e| ValidationError::MalformedFrame(e.to_string()))?;

        let pending = self.pending_mut();
        pending.text = inbound.content;
        if inbound.reply_to.is_some() {
            pending.reply_to = inbound.reply_to;
        }

        if !pending.has_content() {
            return Err(ValidationError::ContentRequired.into());
        }
        self.try_complete().await
    }

    /// Uploads an attachment and stages its reference.
    pub async fn accept_attachment(&mut self, bytes: Bytes) -> Result<FrameOutcome, RealtimeError> {
        let content_type = sniff::allowed_content_type(&bytes)?;
        let size = bytes.len();
        let reference = self.collaborators.blobs.put(bytes, content_type).await?;
        debug!(topic = %self.topic, content_type, size, "attachment staged");

        self.pending_mut().attachments.push(reference);
        if self.commit_on_attachment {
            self.try_complete().await
        } else {
            Ok(FrameOutcome::Accumulating)
        }
    }

    async fn try_complete(&mut self) -> Result<FrameOutcome, RealtimeError> {
        let parent = match self.pending.as_ref() {
            Some(p) if p.has_content() => p.reply_to.clone(),
            _ => return Ok(FrameOutcome::Accumulating),
        };

        if let Some(parent_id) = parent {
            match self.collaborators.persister.get(&parent_id).await {
                Ok(found) if found.topic == self.topic => {}
                Ok(_) => {
                    self.discard().await;
                    return Err(ValidationError::ParentOutsideTopic(parent_id).into());
                }
                Err(StoreError::NotFound(_)) => {
                    self.discard().await;
                    return Err(ValidationError::ParentNotFound(parent_id).into());
                }
                Err(e) => return Err(e.into()),
            }
        }

        let Some(pending) = self.pending.as_ref() else {
            return Ok(FrameOutcome::Accumulating);
        };
        let mut item = pending.commit(ItemId::generate(), self.stamper.next());
        item.id = self.collaborators.persister.store(&item).await?;
        self.pending = None;
        info!(topic = %self.topic, item = %item.id, author = %self.author, "item committed");

        if let Err(e) = self.publish_created(&item).await {
            // Stored already; new readers find it through history.
            warn!(topic = %self.topic, item = %item.id, error = %e, "publish after persist failed");
        }
        Ok(FrameOutcome::Completed(item))
    }

    async fn publish_created(&self, item: &Item) -> Result<(), BrokerError> {
        let payload = serde_json::to_value(item).map_err(|e| BrokerError::Encode(e.to_string()))?;
        let envelope =
            Envelope::new(Action::Create, self.topic.clone(), payload, self.stamper.next())
                .with_origin(self.origin.clone());
        self.collaborators.broker.publish(&self.topic, &envelope).await
    }

    /// Drops the pending item and releases any attachments it uploaded.
    pub async fn discard(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };
        for reference in &pending.attachments {
            if let Err(e) = self.collaborators.blobs.delete(reference).await {
                warn!(
                    topic = %self.topic,
                    blob = %reference.0,
                    error = %e,
                    "orphaned attachment not released"
                );
            }
        }
        if pending.has_content() {
            debug!(
                topic = %self.topic,
                attachments = pending.attachments.len(),
                "pending item discarded"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::broker::{ChannelBroker, MemoryBroker};
    use crate::ports::{
        IdentityValidator, MemoryBlobStore, MemoryPersister, Persister, SignedTokenValidator,
    };
    use std::time::Duration;

    const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

    struct Fixture {
        persister: Arc<MemoryPersister>,
        blobs: Arc<MemoryBlobStore>,
        broker: Arc<MemoryBroker>,
        collaborators: Collaborators,
    }

    fn fixture() -> Fixture {
        let persister = Arc::new(MemoryPersister::new());
        let blobs = Arc::new(MemoryBlobStore::default());
        let broker = Arc::new(MemoryBroker::new());
        let identities: Arc<dyn IdentityValidator> = Arc::new(SignedTokenValidator::new("k"));
        let collaborators = Collaborators {
            persister: persister.clone(),
            blobs: blobs.clone(),
            identities,
            broker: broker.clone(),
        };
        Fixture {
            persister,
            blobs,
            broker,
            collaborators,
        }
    }

    fn assembler(f: &Fixture, topic: &Topic) -> MessageAssembler {
        MessageAssembler::new(
            topic.clone(),
            Identity::from("u1"),
            "conn-1",
            f.collaborators.clone(),
            Arc::new(Stamper::new()),
        )
    }

    #[tokio::test]
    async fn attachment_then_text_commits_once() {
        let f = fixture();
        let topic = Topic::entity("post", "42").unwrap();
        let mut sub = f.broker.subscribe(&topic).await.unwrap();
        let mut asm = assembler(&f, &topic);

        let first = asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        assert_eq!(first, FrameOutcome::Accumulating);
        assert!(f.persister.is_empty().await);

        let outcome = asm.accept_text(r#"{"content":"look"}"#).await.unwrap();
        let FrameOutcome::Completed(item) = outcome else {
            panic!("expected completion")
        };
        assert_eq!(item.text, "look");
        assert_eq!(item.attachments.len(), 1);
        assert!(asm.pending().is_none());
        assert_eq!(f.persister.len().await, 1);

        let env = sub.recv().await.unwrap();
        assert_eq!(env.action, Action::Create);
        assert_eq!(env.payload["text"], "look");
        assert_eq!(env.origin.as_deref(), Some("conn-1"));
        assert!(tokio::time::timeout(Duration::from_millis(50), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn next_frame_starts_fresh() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic);
        asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        asm.accept_text(r#"{"content":"one"}"#).await.unwrap();

        let outcome = asm.accept_text(r#"{"content":"two"}"#).await.unwrap();
        let FrameOutcome::Completed(second) = outcome else {
            panic!("expected completion")
        };
        assert!(second.attachments.is_empty());
        assert_eq!(second.text, "two");
    }

    #[tokio::test]
    async fn empty_content_is_rejected_and_never_stored() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic);
        let err = asm.accept_text(r#"{"content":""}"#).await.unwrap_err();
        assert_eq!(err, RealtimeError::Validation(ValidationError::ContentRequired));
        assert!(f.persister.is_empty().await);

        let err = asm.accept_text("not json").await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn unsupported_attachment_keeps_pending() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic);
        asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        let err = asm.accept_attachment(Bytes::from_static(b"%PDF-1.4")).await.unwrap_err();
        assert!(matches!(
            err,
            RealtimeError::Validation(ValidationError::UnsupportedContentType(_))
        ));
        assert_eq!(asm.pending().map(|p| p.attachments.len()), Some(1));
    }

    #[tokio::test]
    async fn bad_parent_resets_and_releases_uploads() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic);
        asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        assert_eq!(f.blobs.len().await, 1);

        let err = asm
            .accept_text(r#"{"content":"re","reply_to":"missing"}"#)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RealtimeError::Validation(ValidationError::ParentNotFound(ItemId::from("missing")))
        );
        assert!(asm.pending().is_none());
        assert!(f.blobs.is_empty().await);
        assert!(f.persister.is_empty().await);
    }

    #[tokio::test]
    async fn parent_on_other_topic_is_rejected() {
        let f = fixture();
        let here = Topic::entity("post", "1").unwrap();
        let elsewhere = Topic::entity("post", "2").unwrap();

        let mut other = assembler(&f, &elsewhere);
        let outcome = other.accept_text(r#"{"content":"p"}"#).await.unwrap();
        let FrameOutcome::Completed(parent) = outcome else {
            panic!("expected completion")
        };

        let mut asm = assembler(&f, &here);
        let raw = format!(r#"{{"content":"child","reply_to":"{}"}}"#, parent.id);
        let err = asm.accept_text(&raw).await.unwrap_err();
        let outside = ValidationError::ParentOutsideTopic(parent.id.clone());
        assert_eq!(err, RealtimeError::Validation(outside));

        let mut same = assembler(&f, &elsewhere);
        let FrameOutcome::Completed(reply) = same.accept_text(&raw).await.unwrap() else {
            panic!("expected completion")
        };
        assert_eq!(reply.reply_to, Some(parent.id));
        assert_eq!(f.persister.get(&reply.id).await.unwrap().text, "child");
    }

    #[tokio::test]
    async fn eager_mode_commits_on_attachment() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic).with_commit_on_attachment(true);
        let outcome = asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        assert!(matches!(outcome, FrameOutcome::Completed(ref item) if item.text.is_empty()));
    }

    #[tokio::test]
    async fn discard_releases_attachments() {
        let f = fixture();
        let topic = Topic::entity("post", "1").unwrap();
        let mut asm = assembler(&f, &topic);
        asm.accept_attachment(Bytes::from_static(PNG)).await.unwrap();
        asm.discard().await;
        asm.discard().await;
        assert!(f.blobs.is_empty().await);
        assert!(f.persister.is_empty().await);
    }
}
