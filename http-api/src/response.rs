use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use serde_json::{json, Value};

/// `{"data": ...}` success envelope
pub(crate) fn data<T: Serialize>(value: T) -> Json<Value> {
    Json(json!({ "data": value }))
}

/// `{"data": ..., "meta": {...}}` envelope for paginated listings
pub(crate) fn data_with_meta<T: Serialize>(value: T, meta: Value) -> Json<Value> {
    Json(json!({ "data": value, "meta": meta }))
}

/// 201 envelope for creations
pub(crate) fn created<T: Serialize>(value: T) -> (StatusCode, Json<Value>) {
    (StatusCode::CREATED, data(value))
}

/// 204 for operations with nothing to return
pub(crate) fn no_content() -> StatusCode {
    StatusCode::NO_CONTENT
}
