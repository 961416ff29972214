// Template routes: prototypes and instantiation.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use caw_core::models::{ApplyTemplate, NewTemplate};
use caw_core::plan::TemplateDefinition;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ApiResult;
use crate::response::{created, data};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct UpdateVersionRequest {
    pub template: TemplateDefinition,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/templates", get(list_templates).post(create_template))
        .route("/api/templates/:id", get(get_template))
        .route("/api/templates/:id/apply", post(apply_template))
        .route("/api/templates/:id/version", put(update_version))
}

async fn create_template(
    State(state): State<AppState>,
    Json(request): Json<NewTemplate>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let template = state.store.templates().create(request).await?;
    Ok(created(template))
}

async fn list_templates(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let templates = state.store.templates().list().await?;
    Ok(data(templates))
}

async fn get_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let template = state.store.templates().get(&template_id).await?;
    Ok(data(template))
}

async fn apply_template(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    Json(request): Json<ApplyTemplate>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let outcome = state.store.templates().apply(&template_id, request).await?;
    Ok(created(outcome))
}

async fn update_version(
    State(state): State<AppState>,
    Path(template_id): Path<String>,
    Json(request): Json<UpdateVersionRequest>,
) -> ApiResult<Json<Value>> {
    let template = state
        .store
        .templates()
        .update_version(&template_id, request.template)
        .await?;
    Ok(data(template))
}
