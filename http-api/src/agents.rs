// Agent routes: registration, heartbeats, messages inbox, stale sweep.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use caw_core::models::{AgentFilter, AgentRole, AgentStatus, AgentUpdate, MessageFilter, NewAgent};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiResult;
use crate::query::parse_list;
use crate::response::{created, data};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// Single status or comma-separated set
    pub status: Option<String>,
    pub role: Option<AgentRole>,
    pub runtime: Option<String>,
    pub workflow_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct HeartbeatRequest {
    pub current_task_id: Option<String>,
    pub status: Option<AgentStatus>,
}

#[derive(Debug, Deserialize)]
pub struct StaleQuery {
    pub timeout_ms: i64,
}

#[derive(Debug, Deserialize)]
pub struct MessagesQuery {
    pub status: Option<String>,
    pub message_type: Option<String>,
    pub priority: Option<String>,
    pub thread_id: Option<String>,
    pub workflow_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UnreadQuery {
    pub priority: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/agents", get(list_agents).post(register_agent))
        .route("/api/agents/stale", get(get_stale))
        .route(
            "/api/agents/:id",
            get(get_agent).put(update_agent).delete(unregister_agent),
        )
        .route("/api/agents/:id/heartbeat", put(heartbeat))
        .route("/api/agents/:id/messages", get(list_messages))
        .route("/api/agents/:id/messages/unread-count", get(count_unread))
}

async fn register_agent(
    State(state): State<AppState>,
    Json(request): Json<NewAgent>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let agent = state.store.agents().register(request).await?;
    Ok(created(agent))
}

async fn list_agents(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Value>> {
    let status = parse_list(query.status.as_deref(), "agent status")?;
    let agents = state
        .store
        .agents()
        .list(AgentFilter {
            status,
            role: query.role,
            runtime: query.runtime,
            workflow_id: query.workflow_id,
        })
        .await?;
    Ok(data(agents))
}

async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let agent = state.store.agents().get(&agent_id).await?;
    Ok(data(agent))
}

async fn update_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<AgentUpdate>,
) -> ApiResult<Json<Value>> {
    let agent = state.store.agents().update(&agent_id, request).await?;
    Ok(data(agent))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(request): Json<HeartbeatRequest>,
) -> ApiResult<Json<Value>> {
    let agent = state
        .store
        .agents()
        .heartbeat(&agent_id, request.current_task_id.as_deref(), request.status)
        .await?;
    Ok(data(agent))
}

async fn unregister_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let outcome = state.store.agents().unregister(&agent_id).await?;
    Ok(data(outcome))
}

async fn get_stale(
    State(state): State<AppState>,
    Query(query): Query<StaleQuery>,
) -> ApiResult<Json<Value>> {
    let agents = state.store.agents().get_stale(query.timeout_ms).await?;
    Ok(data(agents))
}

async fn list_messages(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<MessagesQuery>,
) -> ApiResult<Json<Value>> {
    let filter = MessageFilter {
        status: parse_list(query.status.as_deref(), "message status")?,
        message_type: query.message_type,
        priority: parse_list(query.priority.as_deref(), "message priority")?,
        thread_id: query.thread_id,
        workflow_id: query.workflow_id,
        since: query.since,
        limit: query.limit,
    };
    let messages = state.store.messages().list(&agent_id, filter).await?;
    Ok(data(messages))
}

async fn count_unread(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(query): Query<UnreadQuery>,
) -> ApiResult<Json<Value>> {
    let priorities = parse_list(query.priority.as_deref(), "message priority")?;
    let counts = state
        .store
        .messages()
        .count_unread(&agent_id, priorities.as_deref())
        .await?;
    Ok(data(counts))
}
