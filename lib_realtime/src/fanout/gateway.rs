//! # Connection Gateway
//!
//! Runs one live client connection over any transport that can be expressed as
//! a `Sink<Frame>` plus a `Stream<Item = Result<Frame, E>>`.
//!
//! Lifecycle:
//! 1. Setup, bounded by `setup_timeout`: authenticate, authorize the topic,
//!    subscribe. Anything acquired before a failure is released.
//! 2. A spawned forwarder writes subscription envelopes and the connection's
//!    own error replies to the client.
//! 3. The calling task runs the reader: frames go through the read-only check,
//!    the write limiter and the `MessageAssembler`.
//! 4. Both loops share one cancellation scope. Teardown closes the transport,
//!    cancels the subscription, then discards any half-built item.

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::assembler::{FrameOutcome, MessageAssembler};
use super::broker::Subscription;
use super::envelope::{Frame, Stamper};
use super::topic::{Identity, Topic};
use crate::error::{IdentityError, RealtimeError, ValidationError};
use crate::limiter::RateLimiter;
use crate::ports::Collaborators;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Time allowed for authenticate + subscribe.
    pub setup_timeout_ms: u64,
    /// Frames queued for a client before the forwarder applies backpressure.
    pub outbound_buffer: usize,
    /// Deliver a connection's own items back to it.
    pub echo_own: bool,
    /// Complete an item on a binary frame without waiting for text.
    pub commit_on_attachment: bool,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            setup_timeout_ms: 5_000,
            outbound_buffer: 64,
            echo_own: true,
            commit_on_attachment: false,
        }
    }
}

impl GatewayConfig {
    pub fn setup_timeout(&self) -> Duration {
        Duration::from_millis(self.setup_timeout_ms)
    }
}

/// Which stream the client wants.
#[derive(Debug, Clone, PartialEq)]
pub enum TopicRequest {
    /// One-to-many stream, e.g. `post:42`.
    Entity { kind: String, id: String },
    /// Two-party stream between the caller and `peer`.
    Pair { peer: Identity },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub credential: Option<String>,
    pub target: TopicRequest,
    pub mode: AccessMode,
    /// Key for the write limiter, usually the client address.
    pub client_key: String,
}

/// Per-connection facts settled during setup.
struct Session {
    id: String,
    identity: Option<Identity>,
    topic: Topic,
    mode: AccessMode,
    client_key: String,
}

#[derive(Clone)]
pub struct ConnectionGateway {
    collaborators: Collaborators,
    write_limiter: Option<Arc<RateLimiter>>,
    config: GatewayConfig,
    stamper: Arc<Stamper>,
}

impl ConnectionGateway {
    pub fn new(collaborators: Collaborators, config: GatewayConfig) -> Self {
        Self {
            collaborators,
            write_limiter: None,
            config,
            stamper: Arc::new(Stamper::new()),
        }
    }

    /// Gate every write frame through `limiter`.
    pub fn with_write_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.write_limiter = Some(limiter);
        self
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    async fn authenticate(
        &self,
        credential: Option<&str>,
    ) -> Result<Option<Identity>, RealtimeError> {
        match credential {
            Some(c) if !c.trim().is_empty() => {
                Ok(Some(self.collaborators.identities.validate(c).await?))
            }
            _ => Ok(None),
        }
    }

    fn authorize(
        request: &ConnectRequest,
        identity: Option<&Identity>,
    ) -> Result<Topic, RealtimeError> {
        match (&request.target, identity) {
            (TopicRequest::Pair { .. }, None) => Err(IdentityError::Missing.into()),
            (TopicRequest::Pair { peer }, Some(me)) => Ok(Topic::pair(me, peer)),
            (TopicRequest::Entity { .. }, None) if request.mode == AccessMode::ReadWrite => {
                Err(IdentityError::Missing.into())
            }
            (TopicRequest::Entity { kind, id }, _) => Ok(Topic::entity(kind, id)?),
        }
    }

    async fn setup(
        &self,
        request: &ConnectRequest,
    ) -> Result<(Session, Subscription), RealtimeError> {
        let identity = self.authenticate(request.credential.as_deref()).await?;
        let topic = Self::authorize(request, identity.as_ref())?;
        let subscription = self.collaborators.broker.subscribe(&topic).await?;
        let session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            identity,
            topic,
            mode: request.mode,
            client_key: request.client_key.clone(),
        };
        Ok((session, subscription))
    }

    /// Serves one connection until the client leaves or the transport fails.
    /// Returns `Err` only when setup fails; the client has been told why.
    pub async fn serve<Tx, Rx, E>(
        &self,
        request: ConnectRequest,
        mut sink: Tx,
        mut source: Rx,
    ) -> Result<(), RealtimeError>
    where
        Tx: Sink<Frame> + Unpin + Send + 'static,
        Tx::Error: Display + Send,
        Rx: Stream<Item = Result<Frame, E>> + Unpin + Send,
        E: Display + Send,
    {
        let setup = tokio::time::timeout(self.config.setup_timeout(), self.setup(&request))
            .await
            .unwrap_or(Err(RealtimeError::Timeout));
        let (session, subscription) = match setup {
            Ok(ready) => ready,
            Err(e) => {
                debug!(error = %e, "connection setup rejected");
                let _ = sink.send(Frame::error(&e)).await;
                let _ = sink.send(Frame::Close).await;
                let _ = sink.close().await;
                return Err(e);
            }
        };

        info!(
            connection = %session.id,
            topic = %session.topic,
            identity = ?session.identity.as_ref().map(Identity::as_str),
            "connection opened"
        );

        let scope = CancellationToken::new();
        let (reply_tx, reply_rx) = mpsc::channel(self.config.outbound_buffer.max(1));
        let forwarder = tokio::spawn(forward(
            sink,
            subscription,
            reply_rx,
            scope.clone(),
            session.id.clone(),
            self.config.echo_own,
        ));

        let mut assembler = session.identity.clone().map(|author| {
            MessageAssembler::new(
                session.topic.clone(),
                author,
                session.id.clone(),
                self.collaborators.clone(),
                Arc::clone(&self.stamper),
            )
            .with_commit_on_attachment(self.config.commit_on_attachment)
        });

        loop {
            let next = tokio::select! {
                biased;
                _ = scope.cancelled() => break,
                next = source.next() => next,
            };
            let result = match next {
                None | Some(Ok(Frame::Close)) => break,
                Some(Ok(frame)) => self.handle_frame(&session, assembler.as_mut(), frame).await,
                Some(Err(e)) => Err(RealtimeError::Transport(e.to_string())),
            };
            match result {
                Ok(FrameOutcome::Completed(item)) => {
                    debug!(connection = %session.id, item = %item.id, "frame completed an item")
                }
                Ok(FrameOutcome::Accumulating) => {}
                Err(e) if e.is_fatal_to_connection() => {
                    debug!(connection = %session.id, error = %e, "client read failed");
                    break;
                }
                Err(e) => {
                    debug!(
                        connection = %session.id,
                        error = %e,
                        kind = e.kind(),
                        "frame rejected"
                    );
                    if reply_tx.send(Frame::error(&e)).await.is_err() {
                        break;
                    }
                }
            }
        }

        scope.cancel();
        drop(reply_tx);
        if let Err(e) = forwarder.await {
            warn!(connection = %session.id, error = %e, "forwarder task failed");
        }
        if let Some(assembler) = assembler.as_mut() {
            assembler.discard().await;
        }
        info!(connection = %session.id, topic = %session.topic, "connection closed");
        Ok(())
    }

    async fn handle_frame(
        &self,
        session: &Session,
        assembler: Option<&mut MessageAssembler>,
        frame: Frame,
    ) -> Result<FrameOutcome, RealtimeError> {
        let assembler = match (session.mode, assembler) {
            (AccessMode::ReadWrite, Some(assembler)) => assembler,
            _ => return Err(ValidationError::ReadOnly.into()),
        };
        if let Some(limiter) = &self.write_limiter {
            limiter.admit(&session.client_key).await?;
        }
        match frame {
            Frame::Text(text) => assembler.accept_text(&text).await,
            Frame::Binary(bytes) => assembler.accept_attachment(bytes).await,
            Frame::Close => Ok(FrameOutcome::Accumulating),
        }
    }
}

/// Writes subscription envelopes and replies until the scope ends or a write
/// fails, then closes the transport and releases the subscription.
async fn forward<Tx>(
    mut sink: Tx,
    mut subscription: Subscription,
    mut replies: mpsc::Receiver<Frame>,
    scope: CancellationToken,
    connection_id: String,
    echo_own: bool,
) where
    Tx: Sink<Frame> + Unpin + Send + 'static,
    Tx::Error: Display + Send,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            reply = replies.recv() => match reply {
                Some(frame) => frame,
                None => break,
            },
            envelope = subscription.recv() => match envelope {
                Some(envelope) => {
                    if !echo_own && envelope.origin.as_deref() == Some(connection_id.as_str()) {
                        continue;
                    }
                    match envelope.to_client_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            warn!(
                                connection = %connection_id,
                                error = %e,
                                "envelope not encodable, skipped"
                            );
                            continue;
                        }
                    }
                }
                None => {
                    debug!(
                        connection = %connection_id,
                        topic = %subscription.topic(),
                        "subscription ended"
                    );
                    break;
                }
            },
        };
        if let Err(e) = sink.send(frame).await {
            debug!(connection = %connection_id, error = %e, "client write failed");
            break;
        }
    }

    scope.cancel();
    let _ = sink.send(Frame::Close).await;
    let _ = sink.close().await;
    subscription.cancel();
}
