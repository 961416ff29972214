// Workflow routes: CRUD, planning, scheduling views, repositories, locks.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use caw_core::models::{
    AddTaskInput, CreateWorkflow, SummaryFormat, WorkflowFilter, WorkflowStatus, WorkspaceStatus,
};
use caw_core::plan::{PlanInput, ReplanInput};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::ApiResult;
use crate::query::parse_list;
use crate::response::{created, data, data_with_meta};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub repository_id: Option<String>,
    /// Single status or comma-separated set
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct GetQuery {
    #[serde(default)]
    pub include_tasks: bool,
}

#[derive(Debug, Deserialize)]
pub struct UpdateStatusRequest {
    pub status: WorkflowStatus,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ParallelismRequest {
    pub max_parallel_tasks: i64,
    pub auto_create_workspaces: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    #[serde(default)]
    pub format: SummaryFormat,
}

#[derive(Debug, Deserialize)]
pub struct NextTasksQuery {
    #[serde(default)]
    pub include_failed: bool,
    #[serde(default)]
    pub include_paused: bool,
}

#[derive(Debug, Deserialize)]
pub struct AddRepositoryRequest {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct WorkspacesQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct LockRequest {
    pub session_id: String,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", get(list_workflows).post(create_workflow))
        .route("/api/workflows/:id", get(get_workflow))
        .route("/api/workflows/:id/status", put(update_status))
        .route("/api/workflows/:id/plan", put(set_plan))
        .route("/api/workflows/:id/replan", post(replan))
        .route("/api/workflows/:id/parallelism", put(set_parallelism))
        .route("/api/workflows/:id/summary", get(get_summary))
        .route("/api/workflows/:id/tasks", post(add_task))
        .route("/api/workflows/:id/tasks/:task_id", delete(remove_task))
        .route("/api/workflows/:id/progress", get(get_progress))
        .route("/api/workflows/:id/next-tasks", get(get_next_tasks))
        .route("/api/workflows/:id/dependencies", get(get_dependencies))
        .route(
            "/api/workflows/:id/repositories",
            get(list_repositories).post(add_repository),
        )
        .route(
            "/api/workflows/:id/repositories/:repository_id",
            delete(remove_repository),
        )
        .route("/api/workflows/:id/workspaces", get(list_workspaces))
        .route("/api/workflows/:id/lock", get(get_lock_info).post(lock))
        .route("/api/workflows/:id/unlock", post(unlock))
}

async fn create_workflow(
    State(state): State<AppState>,
    Json(request): Json<CreateWorkflow>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let workflow = state.store.workflows().create(request).await?;
    Ok(created(workflow))
}

async fn list_workflows(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let statuses = parse_list(query.status.as_deref(), "workflow status")?;
    let filter = WorkflowFilter {
        repository_id: query.repository_id,
        statuses,
        limit: query.limit,
        offset: query.offset,
    };
    let limit = filter.limit.unwrap_or(20);
    let offset = filter.offset.unwrap_or(0);
    let list = state.store.workflows().list(filter).await?;
    Ok(data_with_meta(
        list.workflows,
        json!({ "total": list.total, "limit": limit, "offset": offset }),
    ))
}

async fn get_workflow(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<GetQuery>,
) -> ApiResult<Json<Value>> {
    let detail = state
        .store
        .workflows()
        .get(&workflow_id, query.include_tasks)
        .await?;
    Ok(data(detail))
}

async fn update_status(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<UpdateStatusRequest>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .store
        .workflows()
        .update_status(&workflow_id, request.status, request.reason)
        .await?;
    Ok(data(workflow))
}

async fn set_plan(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(plan): Json<PlanInput>,
) -> ApiResult<Json<Value>> {
    let applied = state.store.workflows().set_plan(&workflow_id, plan).await?;
    Ok(data(applied))
}

async fn replan(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<ReplanInput>,
) -> ApiResult<Json<Value>> {
    let outcome = state.store.workflows().replan(&workflow_id, request).await?;
    Ok(data(outcome))
}

async fn set_parallelism(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<ParallelismRequest>,
) -> ApiResult<Json<Value>> {
    let workflow = state
        .store
        .workflows()
        .set_parallelism(
            &workflow_id,
            request.max_parallel_tasks,
            request.auto_create_workspaces,
        )
        .await?;
    Ok(data(workflow))
}

async fn get_summary(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<SummaryQuery>,
) -> ApiResult<Json<Value>> {
    let summary = state
        .store
        .workflows()
        .get_summary(&workflow_id, query.format)
        .await?;
    Ok(data(summary))
}

async fn add_task(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<AddTaskInput>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let task = state.store.workflows().add_task(&workflow_id, request).await?;
    Ok(created(task))
}

async fn remove_task(
    State(state): State<AppState>,
    Path((workflow_id, task_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .store
        .workflows()
        .remove_task(&workflow_id, &task_id)
        .await?;
    Ok(data(outcome))
}

async fn get_progress(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let progress = state.store.orchestration().get_progress(&workflow_id).await?;
    Ok(data(progress))
}

async fn get_next_tasks(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<NextTasksQuery>,
) -> ApiResult<Json<Value>> {
    let next = state
        .store
        .orchestration()
        .get_next_tasks(&workflow_id, query.include_failed, query.include_paused)
        .await?;
    Ok(data(next))
}

async fn get_dependencies(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let edges = state
        .store
        .orchestration()
        .get_workflow_dependencies(&workflow_id)
        .await?;
    Ok(data(edges))
}

async fn list_repositories(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let repositories = state.store.workflows().list_repositories(&workflow_id).await?;
    Ok(data(repositories))
}

async fn add_repository(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<AddRepositoryRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let repository = state
        .store
        .workflows()
        .add_repository(&workflow_id, &request.path)
        .await?;
    Ok(created(repository))
}

async fn remove_repository(
    State(state): State<AppState>,
    Path((workflow_id, repository_id)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    state
        .store
        .workflows()
        .remove_repository(&workflow_id, &repository_id)
        .await?;
    Ok(crate::response::no_content())
}

async fn list_workspaces(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Query(query): Query<WorkspacesQuery>,
) -> ApiResult<Json<Value>> {
    let statuses: Option<Vec<WorkspaceStatus>> =
        parse_list(query.status.as_deref(), "workspace status")?;
    let workspaces = state
        .store
        .workspaces()
        .list(&workflow_id, statuses.as_deref())
        .await?;
    Ok(data(workspaces))
}

async fn get_lock_info(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let info = state.store.locks().get_lock_info(&workflow_id).await?;
    Ok(data(info))
}

async fn lock(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<LockRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state
        .store
        .locks()
        .lock(&workflow_id, &request.session_id)
        .await?;
    Ok(data(outcome))
}

async fn unlock(
    State(state): State<AppState>,
    Path(workflow_id): Path<String>,
    Json(request): Json<LockRequest>,
) -> ApiResult<Json<Value>> {
    state
        .store
        .locks()
        .unlock(&workflow_id, &request.session_id)
        .await?;
    Ok(data(json!({ "unlocked": true })))
}
