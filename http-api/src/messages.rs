// Message routes: send, broadcast, threads, read-state transitions.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use caw_core::models::{BroadcastInput, NewMessage};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::response::{created, data};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub mark_read: bool,
}

#[derive(Debug, Deserialize)]
pub struct IdsRequest {
    pub ids: Vec<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/messages", post(send_message))
        .route("/api/messages/broadcast", post(broadcast))
        .route("/api/messages/mark-read", put(mark_read))
        .route("/api/messages/archive", put(archive))
        .route("/api/messages/thread/:thread_id", get(get_thread))
        .route("/api/messages/:id", get(get_message))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<NewMessage>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let message = state.store.messages().send(request).await?;
    Ok(created(message))
}

async fn broadcast(
    State(state): State<AppState>,
    Json(request): Json<BroadcastInput>,
) -> ApiResult<Json<Value>> {
    let outcome = state.store.messages().broadcast(request).await?;
    Ok(data(outcome))
}

async fn mark_read(
    State(state): State<AppState>,
    Json(request): Json<IdsRequest>,
) -> ApiResult<Json<Value>> {
    let updated = state.store.messages().mark_read(&request.ids).await?;
    Ok(data(json!({ "updated": updated })))
}

async fn archive(
    State(state): State<AppState>,
    Json(request): Json<IdsRequest>,
) -> ApiResult<Json<Value>> {
    let updated = state.store.messages().archive(&request.ids).await?;
    Ok(data(json!({ "updated": updated })))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(thread_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let messages = state.store.messages().get_thread(&thread_id).await?;
    Ok(data(messages))
}

async fn get_message(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Query(query): Query<GetQuery>,
) -> ApiResult<Json<Value>> {
    let message = state.store.messages().get(&message_id, query.mark_read).await?;
    Ok(data(message))
}
