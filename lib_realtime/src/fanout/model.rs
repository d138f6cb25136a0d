//! # Item Model
//!
//! `Item` is what the persister stores and what `create` envelopes carry.
//! `PendingItem` is the per-connection accumulator an item is built in before
//! it is committed.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::topic::{Identity, ItemId, Topic};

/// Reference returned by the blob store for an uploaded attachment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(pub String);

/// Per-kind list of users who reacted with that kind.
pub type Reactions = BTreeMap<String, Vec<Identity>>;

/// A committed comment or chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub topic: Topic,
    pub author: Identity,
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ItemId>,
    #[serde(default)]
    pub reactions: Reactions,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Partial update applied through `Persister::update`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ItemUpdate {
    pub text: Option<String>,
    pub reactions: Option<Reactions>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Item {
    /// Applies the fields present in `update`.
    pub fn apply(&mut self, update: &ItemUpdate) {
        if let Some(text) = &update.text {
            self.text = text.clone();
        }
        if let Some(reactions) = &update.reactions {
            self.reactions = reactions.clone();
        }
        if update.updated_at.is_some() {
            self.updated_at = update.updated_at;
        }
    }
}

/// An item under construction on one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingItem {
    pub topic: Topic,
    pub author: Identity,
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
    pub reply_to: Option<ItemId>,
}

impl PendingItem {
    pub fn new(topic: Topic, author: Identity) -> Self {
        Self {
            topic,
            author,
            text: String::new(),
            attachments: Vec::new(),
            reply_to: None,
        }
    }

    /// True when there is something worth persisting.
    pub fn has_content(&self) -> bool {
        !self.text.is_empty() || !self.attachments.is_empty()
    }

    /// Builds the committed item, stamping identity and creation time.
    pub fn commit(&self, id: ItemId, created_at: DateTime<Utc>) -> Item {
        Item {
            id,
            topic: self.topic.clone(),
            author: self.author.clone(),
            text: self.text.clone(),
            attachments: self.attachments.clone(),
            reply_to: self.reply_to.clone(),
            reactions: Reactions::new(),
            created_at,
            updated_at: None,
        }
    }
}

/// Body of an inbound JSON text frame. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundText {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<ItemId>,
}
