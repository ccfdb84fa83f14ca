use axum::{
    Json,
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rotation::database::DatabaseError;
use serde::Serialize;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::InvalidRequest(rejection.body_text())
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            // Still rejected after the retries: most likely mid-rotation
            ApiError::Database(err) if err.is_auth_failure() => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Database(DatabaseError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Database(DatabaseError::Conflict) => StatusCode::CONFLICT,
            ApiError::Database(DatabaseError::BadRequest(_)) => StatusCode::BAD_REQUEST,
            ApiError::Database(DatabaseError::Timeout) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Database(DatabaseError::Throttled) => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Database(_) => StatusCode::BAD_GATEWAY,
        }
    }

    fn message(&self) -> String {
        match self {
            ApiError::Database(err) if err.is_auth_failure() => {
                "database temporarily unavailable, retry later".to_string()
            }
            other => other.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self, "document request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self, "document request rejected");
        }

        let body = Json(ApiErrorResponse {
            error_message: self.message(),
        });
        (status, body).into_response()
    }
}
