//! # Error Taxonomy
//!
//! Every failure in this crate is a value. Collaborator errors (`StoreError`,
//! `BlobError`, ...) are wrapped by `RealtimeError`, whose variants decide how
//! far a failure travels: frame-local errors are reported to the sender,
//! dependency errors are reported but keep the connection, and only
//! `Transport` ends a connection.

use thiserror::Error;

use crate::fanout::ItemId;

/// Failures from the durable item store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StoreError {
    #[error("item {0} not found")]
    NotFound(ItemId),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Failures from the attachment blob store.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(String),
    #[error("blob store unavailable: {0}")]
    Unavailable(String),
}

/// Failures from the credential validator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum IdentityError {
    #[error("credential is missing")]
    Missing,
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature does not match")]
    BadSignature,
}

/// Failures talking to the shared publish/subscribe transport.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("envelope could not be encoded: {0}")]
    Encode(String),
}

/// Failures reaching the shared bucket store. Distinct from a denial.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum LimiterError {
    #[error("bucket store unreachable: {0}")]
    Unreachable(String),
    #[error("bucket store returned an unexpected reply: {0}")]
    BadReply(String),
}

/// Problems with what a client sent. Reported to that client only.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ValidationError {
    #[error("invalid message format: {0}")]
    MalformedFrame(String),
    #[error("message content is required")]
    ContentRequired,
    #[error("parent item {0} not found")]
    ParentNotFound(ItemId),
    #[error("parent item {0} belongs to another topic")]
    ParentOutsideTopic(ItemId),
    #[error("unsupported attachment type: {0}")]
    UnsupportedContentType(String),
    #[error("connection is read-only")]
    ReadOnly,
    #[error("invalid topic: {0}")]
    InvalidTopic(String),
    #[error("invalid reaction: {0}")]
    InvalidReaction(String),
    #[error("user has not reacted")]
    NotReacted,
}

/// Failures of a backend this crate depends on.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DependencyError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Blob(#[from] BlobError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Limiter(#[from] LimiterError),
}

/// The umbrella error returned up the call chain.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum RealtimeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Dependency(#[from] DependencyError),
    #[error("too many requests")]
    AdmissionDenied,
    #[error("unauthorized: {0}")]
    Unauthorized(#[from] IdentityError),
    #[error("not allowed to modify item {0}")]
    Forbidden(ItemId),
    #[error("item {0} not found")]
    NotFound(ItemId),
    #[error("operation timed out")]
    Timeout,
    #[error("transport failed: {0}")]
    Transport(String),
}

impl RealtimeError {
    /// Short stable tag written into client error frames.
    pub fn kind(&self) -> &'static str {
        match self {
            RealtimeError::Validation(_) => "validation",
            RealtimeError::Dependency(_) => "dependency",
            RealtimeError::AdmissionDenied => "rate_limited",
            RealtimeError::Unauthorized(_) => "unauthorized",
            RealtimeError::Forbidden(_) => "forbidden",
            RealtimeError::NotFound(_) => "not_found",
            RealtimeError::Timeout => "timeout",
            RealtimeError::Transport(_) => "transport",
        }
    }

    /// Only a broken transport ends a connection.
    pub fn is_fatal_to_connection(&self) -> bool {
        matches!(self, RealtimeError::Transport(_))
    }

    /// Maps a store failure, turning a missing row into `NotFound`.
    pub fn from_store(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => RealtimeError::NotFound(id),
            other => RealtimeError::Dependency(other.into()),
        }
    }
}

impl From<StoreError> for RealtimeError {
    fn from(err: StoreError) -> Self {
        RealtimeError::Dependency(err.into())
    }
}

impl From<BlobError> for RealtimeError {
    fn from(err: BlobError) -> Self {
        RealtimeError::Dependency(err.into())
    }
}

impl From<BrokerError> for RealtimeError {
    fn from(err: BrokerError) -> Self {
        RealtimeError::Dependency(err.into())
    }
}

impl From<LimiterError> for RealtimeError {
    fn from(err: LimiterError) -> Self {
        RealtimeError::Dependency(err.into())
    }
}
