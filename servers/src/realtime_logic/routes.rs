use std::net::SocketAddr;

use axum::{
    Json, Router,
    extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION, request::Parts},
    middleware::{self, Next},
    response::Response,
    routing::{get, post, put},
};
use lib_realtime::error::IdentityError;
use lib_realtime::fanout::HistoryQuery;
use lib_realtime::{Identity, Item, ItemId, Topic};
use serde::Deserialize;
use serde_json::{Value, json};
use tower_http::cors::CorsLayer;
use tracing::info;

use super::error::AppError;
use super::state::AppState;
use super::ws;

/// Raw credential from an `Authorization` header, `Bearer ` prefix kept.
pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Caller(pub Identity);

impl FromRequestParts<AppState> for Caller {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers).ok_or(IdentityError::Missing)?;
        let identity = state.identities.validate(&token).await?;
        Ok(Caller(identity))
    }
}

#[derive(Debug, Deserialize)]
pub struct PageParams {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ChatHistoryParams {
    pub recipient_id: String,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct EditBody {
    pub new_text: String,
}

#[derive(Debug, Deserialize)]
pub struct ReactionBody {
    pub reaction: String,
    #[serde(default = "default_incr")]
    pub incr: bool,
}

fn default_incr() -> bool {
    true
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/comments", get(ws::comments))
        .route("/ws/chat", get(ws::chat))
        .route("/posts/{post_id}/comments", get(post_comments))
        .route("/chat/messages", get(chat_messages))
        .route("/items/{item_id}", put(edit_item).delete(delete_item))
        .route("/items/{item_id}/reactions", post(react_to_item))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Admits every request through the HTTP bucket of the client address.
async fn rate_limit(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    state.http_limiter.admit(&client).await?;
    Ok(next.run(request).await)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn page_body(query: &HistoryQuery, items: Vec<Item>) -> Json<Value> {
    Json(json!({
        "page": query.page,
        "page_size": query.page_size,
        "items": items,
    }))
}

async fn post_comments(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<Json<Value>, AppError> {
    let topic = Topic::entity("post", &post_id)?;
    let query = HistoryQuery::new(topic, params.page, params.page_size);
    let items = state.actions.history(&query).await?;
    Ok(page_body(&query, items))
}

async fn chat_messages(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(params): Query<ChatHistoryParams>,
) -> Result<Json<Value>, AppError> {
    let topic = Topic::pair(&caller, &Identity::new(params.recipient_id));
    let query = HistoryQuery::new(topic, params.page, params.page_size);
    let items = state.actions.history(&query).await?;
    Ok(page_body(&query, items))
}

async fn edit_item(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(item_id): Path<String>,
    Json(body): Json<EditBody>,
) -> Result<Json<Item>, AppError> {
    let item = state
        .actions
        .update_text(&caller, &ItemId::from(item_id.as_str()), &body.new_text)
        .await?;
    Ok(Json(item))
}

async fn delete_item(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(item_id): Path<String>,
) -> Result<StatusCode, AppError> {
    let item_id = ItemId::from(item_id.as_str());
    state.actions.delete(&caller, &item_id).await?;
    info!(item_id = %item_id, user = %caller, "item deleted");
    Ok(StatusCode::NO_CONTENT)
}

async fn react_to_item(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(item_id): Path<String>,
    Json(body): Json<ReactionBody>,
) -> Result<Json<Item>, AppError> {
    let item = state
        .actions
        .react(&caller, &ItemId::from(item_id.as_str()), &body.reaction, body.incr)
        .await?;
    Ok(Json(item))
}
