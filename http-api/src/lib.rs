//! Thin HTTP adapter over the services.
//!
//! Every endpoint returns `{"data": ...}` (plus optional `meta` for
//! pagination) on success and `{"error": {"code", "message"}}` on failure;
//! the error taxonomy maps onto status codes in [`error`]. A permissive
//! CORS layer stamps every response and answers `OPTIONS` preflights.

mod agents;
mod error;
mod events;
mod messages;
mod query;
mod response;
mod sessions;
mod tasks;
mod templates;
mod workflows;
mod workspaces;

use axum::routing::get;
use axum::Router;
use caw_database::Store;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use error::{ApiError, ApiResult};

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
}

/// Assemble the full API router over a connected store
pub fn router(store: Store) -> Router {
    let state = AppState { store };
    Router::new()
        .merge(workflows::routes())
        .merge(tasks::routes())
        .merge(agents::routes())
        .merge(messages::routes())
        .merge(sessions::routes())
        .merge(workspaces::routes())
        .merge(templates::routes())
        .merge(events::routes())
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on the given address until the process is stopped
pub async fn serve(store: Store, addr: &str) -> std::io::Result<()> {
    let app = router(store);
    tracing::info!(addr, "starting HTTP server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

async fn health(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ApiResult<axum::Json<serde_json::Value>> {
    state.store.health_check().await?;
    Ok(response::data(serde_json::json!({ "status": "ok" })))
}
