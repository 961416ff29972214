// Session routes plus the stale-lock sweep used by housekeeping loops.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, post, put};
use axum::{Json, Router};
use caw_core::models::NewSession;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::response::{created, data, no_content};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ReleaseStaleRequest {
    pub timeout_ms: i64,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/sessions", post(register_session))
        .route("/api/sessions/:id", delete(deregister_session))
        .route("/api/sessions/:id/heartbeat", put(heartbeat))
        .route("/api/locks/release-stale", post(release_stale_locks))
}

async fn register_session(
    State(state): State<AppState>,
    Json(request): Json<NewSession>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let session = state.store.sessions().register(request).await?;
    Ok(created(session))
}

async fn deregister_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<StatusCode> {
    state.store.sessions().deregister(&session_id).await?;
    Ok(no_content())
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let session = state.store.sessions().heartbeat(&session_id).await?;
    Ok(data(session))
}

async fn release_stale_locks(
    State(state): State<AppState>,
    Json(request): Json<ReleaseStaleRequest>,
) -> ApiResult<Json<Value>> {
    let released = state
        .store
        .locks()
        .release_stale_workflow_locks(request.timeout_ms)
        .await?;
    Ok(data(json!({ "released": released })))
}
