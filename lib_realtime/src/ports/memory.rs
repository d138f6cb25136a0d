//! In-process persister and blob store. Used by the server when no external
//! backend is configured and by the test suites.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use super::{BlobStore, Persister};
use crate::error::{BlobError, StoreError};
use crate::fanout::model::{AttachmentRef, Item, ItemUpdate};
use crate::fanout::topic::{ItemId, Topic};

const DEFAULT_PAGE_SIZE: u64 = 10;

#[derive(Default)]
pub struct MemoryPersister {
    items: RwLock<HashMap<ItemId, Item>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }
}

#[async_trait]
impl Persister for MemoryPersister {
    async fn store(&self, item: &Item) -> Result<ItemId, StoreError> {
        self.items.write().await.insert(item.id.clone(), item.clone());
        Ok(item.id.clone())
    }

    async fn get(&self, id: &ItemId) -> Result<Item, StoreError> {
        self.items
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn update(&self, id: &ItemId, fields: ItemUpdate) -> Result<(), StoreError> {
        let mut items = self.items.write().await;
        let item = items.get_mut(id).ok_or_else(|| StoreError::NotFound(id.clone()))?;
        item.apply(&fields);
        Ok(())
    }

    async fn delete(&self, id: &ItemId) -> Result<(), StoreError> {
        self.items
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }

    async fn list_by_topic(
        &self,
        topic: &Topic,
        page: u64,
        page_size: u64,
    ) -> Result<Vec<Item>, StoreError> {
        let page = page.max(1);
        let page_size = if page_size < 1 { DEFAULT_PAGE_SIZE } else { page_size };
        let skip = usize::try_from((page - 1).saturating_mul(page_size)).unwrap_or(usize::MAX);
        let take = usize::try_from(page_size).unwrap_or(usize::MAX);

        let items = self.items.read().await;
        let mut matching: Vec<&Item> = items.values().filter(|i| &i.topic == topic).collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(matching
            .into_iter()
            .skip(skip)
            .take(take)
            .cloned()
            .collect())
    }
}

struct StoredBlob {
    content_type: String,
    _bytes: Bytes,
}

/// Keeps attachments in memory and serves them from `base_url`.
pub struct MemoryBlobStore {
    base_url: String,
    blobs: RwLock<HashMap<String, StoredBlob>>,
}

impl MemoryBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            blobs: RwLock::new(HashMap::new()),
        }
    }

    pub async fn contains(&self, reference: &AttachmentRef) -> bool {
        self.blobs.read().await.contains_key(&reference.0)
    }

    pub async fn len(&self) -> usize {
        self.blobs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.blobs.read().await.is_empty()
    }

    pub async fn content_type(&self, reference: &AttachmentRef) -> Option<String> {
        self.blobs
            .read()
            .await
            .get(&reference.0)
            .map(|b| b.content_type.clone())
    }
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new("/files")
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, bytes: Bytes, content_type: &str) -> Result<AttachmentRef, BlobError> {
        let key = uuid::Uuid::new_v4().simple().to_string();
        self.blobs.write().await.insert(
            key.clone(),
            StoredBlob {
                content_type: content_type.to_string(),
                _bytes: bytes,
            },
        );
        Ok(AttachmentRef(key))
    }

    async fn get(&self, reference: &AttachmentRef) -> Result<String, BlobError> {
        if !self.contains(reference).await {
            return Err(BlobError::NotFound(reference.0.clone()));
        }
        Ok(format!("{}/{}", self.base_url.trim_end_matches('/'), reference.0))
    }

    async fn delete(&self, reference: &AttachmentRef) -> Result<(), BlobError> {
        self.blobs
            .write()
            .await
            .remove(&reference.0)
            .map(|_| ())
            .ok_or_else(|| BlobError::NotFound(reference.0.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::model::PendingItem;
    use crate::fanout::topic::Identity;
    use chrono::{Duration, Utc};

    fn item(topic: &Topic, n: i64) -> Item {
        let mut p = PendingItem::new(topic.clone(), Identity::from("u1"));
        p.text = format!("item {}", n);
        p.commit(ItemId::from(format!("i{}", n)), Utc::now() + Duration::seconds(n))
    }

    #[tokio::test]
    async fn list_is_newest_first_and_paged() {
        let persister = MemoryPersister::new();
        let topic = Topic::entity("post", "1").unwrap();
        let other = Topic::entity("post", "2").unwrap();
        for n in 0..5 {
            persister.store(&item(&topic, n)).await.unwrap();
        }
        persister.store(&item(&other, 99)).await.unwrap();

        let first = persister.list_by_topic(&topic, 1, 2).await.unwrap();
        assert_eq!(first.iter().map(|i| i.text.as_str()).collect::<Vec<_>>(), ["item 4", "item 3"]);

        let last = persister.list_by_topic(&topic, 3, 2).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].text, "item 0");

        // Out-of-range paging falls back to the defaults.
        let coerced = persister.list_by_topic(&topic, 0, 0).await.unwrap();
        assert_eq!(coerced.len(), 5);
    }

    #[tokio::test]
    async fn huge_pages_are_empty_not_a_panic() {
        let persister = MemoryPersister::new();
        let topic = Topic::entity("post", "1").unwrap();
        persister.store(&item(&topic, 1)).await.unwrap();

        let far = persister.list_by_topic(&topic, u64::MAX, u64::MAX).await.unwrap();
        assert!(far.is_empty());
        let wide = persister.list_by_topic(&topic, 1, u64::MAX).await.unwrap();
        assert_eq!(wide.len(), 1);
    }

    #[tokio::test]
    async fn missing_items_are_not_found() {
        let persister = MemoryPersister::new();
        let id = ItemId::from("nope");
        assert_eq!(persister.get(&id).await, Err(StoreError::NotFound(id.clone())));
        assert_eq!(persister.delete(&id).await, Err(StoreError::NotFound(id)));
    }

    #[tokio::test]
    async fn blob_round_trip() {
        let blobs = MemoryBlobStore::new("https://cdn.example/");
        let r = blobs.put(Bytes::from_static(b"abc"), "image/png").await.unwrap();
        assert_eq!(blobs.get(&r).await.unwrap(), format!("https://cdn.example/{}", r.0));
        assert_eq!(blobs.content_type(&r).await.as_deref(), Some("image/png"));
        blobs.delete(&r).await.unwrap();
        assert!(blobs.get(&r).await.is_err());
    }
}
