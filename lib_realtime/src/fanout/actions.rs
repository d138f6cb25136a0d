//! # Item Actions
//!
//! Mutations that arrive on the request path rather than over a live
//! connection: edit, delete, react, and history paging. Each mutation is
//! persisted first and then announced on the item's topic; a failed announce
//! is logged and left alone.
//!
//! Read-modify-write on one item (edit, react) is serialized per item within
//! this process, so concurrent reactions from different users all land.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

use super::broker::ChannelBroker;
use super::envelope::{Action, Envelope, Stamper};
use super::model::{Item, ItemUpdate};
use super::reactions::apply_reaction;
use super::topic::{Identity, ItemId, Topic};
use crate::error::{RealtimeError, ValidationError};
use crate::ports::{Collaborators, Persister};

const DEFAULT_PAGE: u64 = 1;
const DEFAULT_PAGE_SIZE: u64 = 10;
const MAX_PAGE_SIZE: u64 = 100;
const LOCK_STRIPES: usize = 64;

/// A page request with out-of-range values coerced to the defaults.
/// `page_size` is capped at `MAX_PAGE_SIZE`.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryQuery {
    pub topic: Topic,
    pub page: u64,
    pub page_size: u64,
}

impl HistoryQuery {
    pub fn new(topic: Topic, page: Option<i64>, page_size: Option<i64>) -> Self {
        let page = page.filter(|p| *p >= 1).map_or(DEFAULT_PAGE, |p| p as u64);
        let page_size = page_size
            .filter(|s| *s >= 1)
            .map_or(DEFAULT_PAGE_SIZE, |s| (s as u64).min(MAX_PAGE_SIZE));
        Self { topic, page, page_size }
    }
}

/// Striped per-item locks. Items that hash to the same stripe share a lock.
struct ItemLocks(Vec<Mutex<()>>);

impl ItemLocks {
    fn new() -> Self {
        Self((0..LOCK_STRIPES).map(|_| Mutex::new(())).collect())
    }

    async fn lock(&self, id: &ItemId) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        id.hash(&mut hasher);
        let stripe = (hasher.finish() % self.0.len() as u64) as usize;
        self.0[stripe].lock().await
    }
}

#[derive(Clone)]
pub struct ItemActions {
    persister: Arc<dyn Persister>,
    broker: Arc<dyn ChannelBroker>,
    stamper: Arc<Stamper>,
    locks: Arc<ItemLocks>,
}

impl ItemActions {
    pub fn new(collaborators: &Collaborators) -> Self {
        Self {
            persister: Arc::clone(&collaborators.persister),
            broker: Arc::clone(&collaborators.broker),
            stamper: Arc::new(Stamper::new()),
            locks: Arc::new(ItemLocks::new()),
        }
    }

    async fn owned_item(&self, actor: &Identity, id: &ItemId) -> Result<Item, RealtimeError> {
        let item = self.persister.get(id).await.map_err(RealtimeError::from_store)?;
        if &item.author != actor {
            return Err(RealtimeError::Forbidden(id.clone()));
        }
        Ok(item)
    }

    async fn announce(&self, action: Action, topic: &Topic, payload: Value) {
        let envelope = Envelope::new(action, topic.clone(), payload, self.stamper.next());
        if let Err(e) = self.broker.publish(topic, &envelope).await {
            warn!(topic = %topic, ?action, error = %e, "announce failed");
        }
    }

    /// Replaces the text of an item the actor wrote.
    pub async fn update_text(
        &self,
        actor: &Identity,
        id: &ItemId,
        new_text: &str,
    ) -> Result<Item, RealtimeError> {
        if new_text.trim().is_empty() {
            return Err(ValidationError::ContentRequired.into());
        }
        let guard = self.locks.lock(id).await;
        let mut item = self.owned_item(actor, id).await?;

        let update = ItemUpdate {
            text: Some(new_text.to_string()),
            updated_at: Some(self.stamper.next()),
            ..Default::default()
        };
        self.persister
            .update(id, update.clone())
            .await
            .map_err(RealtimeError::from_store)?;
        item.apply(&update);
        drop(guard);
        info!(item = %id, topic = %item.topic, "item edited");

        self.announce(
            Action::Update,
            &item.topic,
            json!({ "item_id": id, "new_text": new_text, "item": item }),
        )
        .await;
        Ok(item)
    }

    /// Deletes an item the actor wrote.
    pub async fn delete(&self, actor: &Identity, id: &ItemId) -> Result<(), RealtimeError> {
        let item = self.owned_item(actor, id).await?;
        self.persister.delete(id).await.map_err(RealtimeError::from_store)?;
        info!(item = %id, topic = %item.topic, "item deleted");

        self.announce(Action::Delete, &item.topic, json!({ "item_id": id })).await;
        Ok(())
    }

    /// Adds (`incr`) or removes the actor's reaction on any item.
    pub async fn react(
        &self,
        actor: &Identity,
        id: &ItemId,
        reaction: &str,
        incr: bool,
    ) -> Result<Item, RealtimeError> {
        let item = {
            let _guard = self.locks.lock(id).await;
            let mut item = self.persister.get(id).await.map_err(RealtimeError::from_store)?;
            let mut reactions = item.reactions.clone();
            apply_reaction(&mut reactions, actor, reaction, incr)?;

            let update = ItemUpdate {
                reactions: Some(reactions),
                ..Default::default()
            };
            self.persister
                .update(id, update.clone())
                .await
                .map_err(RealtimeError::from_store)?;
            item.apply(&update);
            item
        };

        self.announce(
            Action::Reaction,
            &item.topic,
            json!({
                "item_id": id,
                "user_id": actor,
                "reaction": reaction,
                "incr": incr,
                "item": item,
            }),
        )
        .await;
        Ok(item)
    }

    /// One page of a topic's items, newest first.
    pub async fn history(&self, query: &HistoryQuery) -> Result<Vec<Item>, RealtimeError> {
        Ok(self
            .persister
            .list_by_topic(&query.topic, query.page, query.page_size)
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fanout::broker::MemoryBroker;
    use crate::fanout::model::PendingItem;
    use crate::ports::{MemoryBlobStore, MemoryPersister, SignedTokenValidator};
    use chrono::Utc;

    async fn setup() -> (ItemActions, Arc<MemoryBroker>, Item) {
        let persister = Arc::new(MemoryPersister::new());
        let broker = Arc::new(MemoryBroker::new());
        let collaborators = Collaborators {
            persister: persister.clone(),
            blobs: Arc::new(MemoryBlobStore::default()),
            identities: Arc::new(SignedTokenValidator::new("k")),
            broker: broker.clone(),
        };
        let topic = Topic::entity("post", "3").unwrap();
        let mut pending = PendingItem::new(topic, Identity::from("author"));
        pending.text = "original".into();
        let item = pending.commit(ItemId::from("c1"), Utc::now());
        persister.store(&item).await.unwrap();
        (ItemActions::new(&collaborators), broker, item)
    }

    #[tokio::test]
    async fn only_author_edits_and_edit_is_announced() {
        let (actions, broker, item) = setup().await;
        let mut sub = broker.subscribe(&item.topic).await.unwrap();

        let err = actions
            .update_text(&Identity::from("intruder"), &item.id, "hacked")
            .await
            .unwrap_err();
        assert_eq!(err, RealtimeError::Forbidden(item.id.clone()));

        let edited = actions
            .update_text(&Identity::from("author"), &item.id, "fixed")
            .await
            .unwrap();
        assert_eq!(edited.text, "fixed");
        assert!(edited.updated_at.is_some());

        let env = sub.recv().await.unwrap();
        assert_eq!(env.action, Action::Update);
        assert_eq!(env.payload["item_id"], "c1");
        assert_eq!(env.payload["new_text"], "fixed");
        assert_eq!(env.payload["item"]["text"], "fixed");
    }

    #[tokio::test]
    async fn delete_then_not_found() {
        let (actions, broker, item) = setup().await;
        let mut sub = broker.subscribe(&item.topic).await.unwrap();
        let author = Identity::from("author");

        actions.delete(&author, &item.id).await.unwrap();
        let env = sub.recv().await.unwrap();
        assert_eq!(env.action, Action::Delete);
        assert_eq!(env.payload, json!({ "item_id": "c1" }));

        assert_eq!(
            actions.delete(&author, &item.id).await,
            Err(RealtimeError::NotFound(item.id.clone()))
        );
    }

    #[tokio::test]
    async fn reactions_replace_and_remove() {
        let (actions, broker, item) = setup().await;
        let mut sub = broker.subscribe(&item.topic).await.unwrap();
        let fan = Identity::from("fan");

        actions.react(&fan, &item.id, "like", true).await.unwrap();
        let after = actions.react(&fan, &item.id, "love", true).await.unwrap();
        assert!(!after.reactions.contains_key("like"));
        assert_eq!(after.reactions["love"], vec![fan.clone()]);

        let _ = sub.recv().await.unwrap();
        let env = sub.recv().await.unwrap();
        assert_eq!(env.action, Action::Reaction);
        assert_eq!(env.payload["user_id"], "fan");
        assert_eq!(env.payload["reaction"], "love");
        assert_eq!(env.payload["incr"], true);

        let cleared = actions.react(&fan, &item.id, "love", false).await.unwrap();
        assert!(cleared.reactions.is_empty());
        assert_eq!(
            actions.react(&fan, &item.id, "love", false).await,
            Err(RealtimeError::Validation(ValidationError::NotReacted))
        );
    }

    #[test]
    fn history_query_coerces_bad_paging() {
        let topic = Topic::entity("post", "1").unwrap();
        let q = HistoryQuery::new(topic.clone(), Some(0), Some(-5));
        assert_eq!((q.page, q.page_size), (1, 10));
        let q = HistoryQuery::new(topic.clone(), Some(3), None);
        assert_eq!((q.page, q.page_size), (3, 10));
        let q = HistoryQuery::new(topic, Some(i64::MAX), Some(i64::MAX));
        assert_eq!((q.page, q.page_size), (i64::MAX as u64, MAX_PAGE_SIZE));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reactions_all_land() {
        let (actions, _broker, item) = setup().await;
        let tasks: Vec<_> = (0..32)
            .map(|n| {
                let actions = actions.clone();
                let id = item.id.clone();
                tokio::spawn(async move {
                    actions.react(&Identity::new(format!("fan{}", n)), &id, "like", true).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let stored = actions.persister.get(&item.id).await.unwrap();
        assert_eq!(stored.reactions["like"].len(), 32);
    }
}
