// Workspace routes: creation, status updates, task assignment.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{post, put};
use axum::{Json, Router};
use caw_core::models::{NewWorkspace, WorkspaceUpdate};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiResult;
use crate::response::{created, data};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub task_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/workspaces", post(create_workspace))
        .route("/api/workspaces/:id", put(update_workspace))
        .route("/api/workspaces/:id/assign", post(assign_task))
}

async fn create_workspace(
    State(state): State<AppState>,
    Json(request): Json<NewWorkspace>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let workspace = state.store.workspaces().create(request).await?;
    Ok(created(workspace))
}

async fn update_workspace(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<WorkspaceUpdate>,
) -> ApiResult<Json<Value>> {
    let workspace = state.store.workspaces().update(&workspace_id, request).await?;
    Ok(data(workspace))
}

async fn assign_task(
    State(state): State<AppState>,
    Path(workspace_id): Path<String>,
    Json(request): Json<AssignRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .store
        .workspaces()
        .assign_task(&request.task_id, &workspace_id)
        .await?;
    Ok(data(task))
}
