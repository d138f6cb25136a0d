//! # Envelopes and Frames
//!
//! An `Envelope` is the unit the broker carries: `{action, topic, payload,
//! timestamp}`. A `Frame` is the unit a client transport carries. The gateway
//! turns envelopes into text frames on the way out.

use std::sync::atomic::{AtomicI64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::topic::Topic;
use crate::error::{BrokerError, RealtimeError};

/// What happened to the item an envelope describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
    Reaction,
}

/// The published unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    pub topic: Topic,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    /// Connection id of the publisher, used for self-echo filtering.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
}

impl Envelope {
    pub fn new(action: Action, topic: Topic, payload: Value, timestamp: DateTime<Utc>) -> Self {
        Self {
            action,
            topic,
            payload,
            timestamp,
            origin: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Wire encoding used between instances.
    pub fn encode(&self) -> Result<String, BrokerError> {
        serde_json::to_string(self).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    pub fn decode(raw: &str) -> Result<Self, BrokerError> {
        serde_json::from_str(raw).map_err(|e| BrokerError::Encode(e.to_string()))
    }

    /// Client-facing text frame. The origin tag is internal and is dropped.
    pub fn to_client_frame(&self) -> Result<Frame, BrokerError> {
        let mut outbound = self.clone();
        outbound.origin = None;
        outbound.encode().map(Frame::Text)
    }
}

/// Hands out timestamps that never go backwards for one publisher.
#[derive(Debug, Default)]
pub struct Stamper {
    last_micros: AtomicI64,
}

impl Stamper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> DateTime<Utc> {
        let now = Utc::now();
        let now_micros = now.timestamp_micros();
        let prev = self.last_micros.fetch_max(now_micros, Ordering::SeqCst);
        // Truncated to micros so equal stamps compare equal.
        DateTime::from_timestamp_micros(prev.max(now_micros)).unwrap_or(now)
    }
}

/// One message on a client transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Close,
}

impl Frame {
    /// Error frame reported to the client that caused `err`.
    pub fn error(err: &RealtimeError) -> Self {
        Frame::Text(json!({ "error": err.to_string(), "kind": err.kind() }).to_string())
    }
}
