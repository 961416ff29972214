use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use caw_core::error::Error;
use serde_json::json;

/// Wrapper mapping the core taxonomy onto HTTP responses
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = std::result::Result<T, ApiError>;

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.0.status_code())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        }
        let body = Json(json!({
            "error": {
                "code": self.0.code(),
                "message": self.0.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (Error::not_found("task", "tk_0123456789ab"), 404),
            (Error::Validation("bad".into()), 400),
            (Error::InvalidState("bad".into()), 400),
            (Error::Conflict("held".into()), 409),
            (Error::Database("boom".into()), 500),
        ];
        for (error, expected) in cases {
            let response = ApiError(error).into_response();
            assert_eq!(response.status().as_u16(), expected);
        }
    }
}
