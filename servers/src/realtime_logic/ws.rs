use std::future;
use std::net::SocketAddr;

use axum::{
    extract::{
        ConnectInfo, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use lib_realtime::Frame;
use lib_realtime::fanout::{AccessMode, ConnectRequest, Identity, TopicRequest};
use serde::Deserialize;
use tracing::debug;

use super::routes::bearer_token;
use super::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CommentsQuery {
    pub post_id: String,
    /// Browsers cannot set headers on a WebSocket handshake.
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatQuery {
    pub recipient_id: String,
    pub token: Option<String>,
}

/// `GET /ws/comments?post_id=` : read/write with a credential, read-only without.
pub async fn comments(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<CommentsQuery>,
) -> impl IntoResponse {
    let credential = bearer_token(&headers).or(query.token);
    let mode = if credential.is_some() {
        AccessMode::ReadWrite
    } else {
        AccessMode::ReadOnly
    };
    let request = ConnectRequest {
        credential,
        target: TopicRequest::Entity {
            kind: "post".to_string(),
            id: query.post_id,
        },
        mode,
        client_key: addr.ip().to_string(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, request))
}

/// `GET /ws/chat?recipient_id=` : credential required.
pub async fn chat(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ChatQuery>,
) -> impl IntoResponse {
    let request = ConnectRequest {
        credential: bearer_token(&headers).or(query.token),
        target: TopicRequest::Pair {
            peer: Identity::new(query.recipient_id),
        },
        mode: AccessMode::ReadWrite,
        client_key: addr.ip().to_string(),
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, request))
}

fn to_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text.into()),
        Frame::Binary(bytes) => Message::Binary(bytes),
        Frame::Close => Message::Close(None),
    }
}

fn from_message(msg: Result<Message, axum::Error>) -> Option<Result<Frame, axum::Error>> {
    match msg {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text.to_string()))),
        Ok(Message::Binary(bytes)) => Some(Ok(Frame::Binary(bytes))),
        Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
        // axum answers pings itself.
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => None,
        Err(e) => Some(Err(e)),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, request: ConnectRequest) {
    let (sink, stream) = socket.split();
    let sink = sink.with(|frame: Frame| future::ready(Ok::<_, axum::Error>(to_message(frame))));
    let stream = stream.filter_map(|msg| future::ready(from_message(msg)));

    if let Err(e) = state.gateway.serve(request, Box::pin(sink), Box::pin(stream)).await {
        debug!(error = %e, "websocket connection refused");
    }
}
