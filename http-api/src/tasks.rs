// Task routes: lifecycle, plans, claims, checkpoints, context bundles.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use caw_core::models::{
    CheckpointFilter, ContextInclude, ContextOptions, JsonMap, NewCheckpoint, TaskStatus,
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiResult;
use crate::query::parse_list;
use crate::response::{created, data};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub include_checkpoints: bool,
    pub checkpoint_limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AvailableQuery {
    pub workflow_id: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: TaskStatus,
    pub outcome: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SetPlanRequest {
    pub plan: String,
    pub context: Option<JsonMap>,
}

#[derive(Debug, Deserialize)]
pub struct ReplanRequest {
    pub reason: String,
    pub plan: String,
}

#[derive(Debug, Deserialize)]
pub struct ClaimRequest {
    pub agent_id: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub agent_id: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CheckpointsQuery {
    /// Single type or comma-separated set
    pub types: Option<String>,
    pub since_sequence: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ContextQuery {
    pub max_tokens: Option<usize>,
    pub workflow: Option<bool>,
    pub current_task: Option<bool>,
    pub prior_tasks: Option<bool>,
    pub siblings: Option<bool>,
    pub dependencies: Option<bool>,
    #[serde(default)]
    pub all_checkpoints: bool,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/tasks/available", get(get_available))
        .route("/api/tasks/:id", get(get_task))
        .route("/api/tasks/:id/status", put(update_status))
        .route("/api/tasks/:id/plan", put(set_plan))
        .route("/api/tasks/:id/replan", post(replan))
        .route("/api/tasks/:id/claim", post(claim))
        .route("/api/tasks/:id/release", post(release))
        .route("/api/tasks/:id/dependencies", get(get_dependencies))
        .route("/api/tasks/:id/dependencies/check", get(check_dependencies))
        .route(
            "/api/tasks/:id/checkpoints",
            get(list_checkpoints).post(add_checkpoint),
        )
        .route("/api/tasks/:id/context", get(get_context))
}

async fn get_available(
    State(state): State<AppState>,
    Query(query): Query<AvailableQuery>,
) -> ApiResult<Json<Value>> {
    let tasks = state
        .store
        .tasks()
        .get_available(query.workflow_id.as_deref(), query.limit)
        .await?;
    Ok(data(tasks))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<GetQuery>,
) -> ApiResult<Json<Value>> {
    let detail = state
        .store
        .tasks()
        .get(&task_id, query.include_checkpoints, query.checkpoint_limit)
        .await?;
    Ok(data(detail))
}

async fn update_status(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .store
        .tasks()
        .update_status(&task_id, request.status, request.outcome, request.error)
        .await?;
    Ok(data(task))
}

async fn set_plan(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<SetPlanRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .store
        .tasks()
        .set_plan(&task_id, &request.plan, request.context)
        .await?;
    Ok(data(task))
}

async fn replan(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<ReplanRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .store
        .tasks()
        .replan(&task_id, &request.reason, &request.plan)
        .await?;
    Ok(data(outcome))
}

async fn claim(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<ClaimRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.store.tasks().claim(&task_id, &request.agent_id).await?;
    Ok(data(outcome))
}

async fn release(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<ReleaseRequest>,
) -> ApiResult<Json<Value>> {
    let task = state
        .store
        .tasks()
        .release(&task_id, &request.agent_id, request.reason.as_deref())
        .await?;
    Ok(data(task))
}

async fn get_dependencies(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let dependencies = state.store.tasks().get_dependencies(&task_id).await?;
    Ok(data(dependencies))
}

async fn check_dependencies(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let check = state.store.orchestration().check_dependencies(&task_id).await?;
    Ok(data(check))
}

async fn list_checkpoints(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<CheckpointsQuery>,
) -> ApiResult<Json<Value>> {
    let types = parse_list(query.types.as_deref(), "checkpoint type")?;
    let checkpoints = state
        .store
        .checkpoints()
        .list(
            &task_id,
            CheckpointFilter {
                types,
                since_sequence: query.since_sequence,
                limit: query.limit,
            },
        )
        .await?;
    Ok(data(checkpoints))
}

async fn add_checkpoint(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Json(request): Json<NewCheckpoint>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let checkpoint = state.store.checkpoints().add(&task_id, request).await?;
    Ok(created(checkpoint))
}

async fn get_context(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<ContextQuery>,
) -> ApiResult<Json<Value>> {
    let defaults = ContextInclude::default();
    let options = ContextOptions {
        max_tokens: query.max_tokens.unwrap_or(8000),
        include: ContextInclude {
            workflow: query.workflow.unwrap_or(defaults.workflow),
            current_task: query.current_task.unwrap_or(defaults.current_task),
            prior_tasks: query.prior_tasks.unwrap_or(defaults.prior_tasks),
            siblings: query.siblings.unwrap_or(defaults.siblings),
            dependencies: query.dependencies.unwrap_or(defaults.dependencies),
            all_checkpoints: query.all_checkpoints,
        },
    };
    let context = state.store.context().load(&task_id, options).await?;
    Ok(data(context))
}
