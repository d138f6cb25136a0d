//! # Collaborator Ports
//!
//! Interfaces this crate calls but does not own: durable item storage, blob
//! storage for attachments, and credential validation. Production wiring plugs
//! real backends in; `memory` and `identity` provide in-process adapters.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{BlobError, IdentityError, StoreError};
use crate::fanout::broker::ChannelBroker;
use crate::fanout::model::{AttachmentRef, Item, ItemUpdate};
use crate::fanout::topic::{Identity, ItemId, Topic};

pub mod identity;
pub mod memory;

pub use identity::SignedTokenValidator;
pub use memory::{MemoryBlobStore, MemoryPersister};

/// Durable storage of committed items.
#[async_trait]
pub trait Persister: Send + Sync {
    async fn store(&self, item: &Item) -> Result<ItemId, StoreError>;
    async fn get(&self, id: &ItemId) -> Result<Item, StoreError>;
    async fn update(&self, id: &ItemId, fields: ItemUpdate) -> Result<(), StoreError>;
    async fn delete(&self, id: &ItemId) -> Result<(), StoreError>;
    /// Newest first. `page` starts at 1.
    async fn list_by_topic(
        &self,
        topic: &Topic,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<Item>, StoreError>;
}

/// Attachment storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<AttachmentRef, BlobError>;
    /// A URL the client can fetch the attachment from.
    async fn get(&self, reference: &AttachmentRef) -> Result<String, BlobError>;
    async fn delete(&self, reference: &AttachmentRef) -> Result<(), BlobError>;
}

/// Turns a presented credential into an identity.
#[async_trait]
pub trait IdentityValidator: Send + Sync {
    async fn validate(&self, credential: &str) -> Result<Identity, IdentityError>;
}

/// Everything a gateway or action handler needs, cheap to clone.
#[derive(Clone)]
pub struct Collaborators {
    pub persister: Arc<dyn Persister>,
    pub blobs: Arc<dyn BlobStore>,
    pub identities: Arc<dyn IdentityValidator>,
    pub broker: Arc<dyn ChannelBroker>,
}
