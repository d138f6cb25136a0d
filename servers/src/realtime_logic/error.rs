use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use lib_realtime::RealtimeError;
use lib_realtime::error::{DependencyError, IdentityError, LimiterError, ValidationError};
use serde_json::json;
use tracing::{error, warn};

/// HTTP face of `RealtimeError`.
#[derive(Debug)]
pub struct AppError(pub RealtimeError);

impl From<RealtimeError> for AppError {
    fn from(err: RealtimeError) -> Self {
        AppError(err)
    }
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        AppError(err.into())
    }
}

impl From<LimiterError> for AppError {
    fn from(err: LimiterError) -> Self {
        AppError(err.into())
    }
}

impl From<IdentityError> for AppError {
    fn from(err: IdentityError) -> Self {
        AppError(err.into())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            RealtimeError::Validation(_) => StatusCode::BAD_REQUEST,
            RealtimeError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RealtimeError::Forbidden(_) => StatusCode::FORBIDDEN,
            RealtimeError::NotFound(_) => StatusCode::NOT_FOUND,
            RealtimeError::AdmissionDenied => StatusCode::TOO_MANY_REQUESTS,
            RealtimeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            RealtimeError::Dependency(_) | RealtimeError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self.0 {
            RealtimeError::Dependency(DependencyError::Limiter(e)) => {
                error!(error = %e, "rate limiter unavailable, request rejected")
            }
            RealtimeError::Dependency(e) => error!(error = %e, "dependency failure"),
            RealtimeError::AdmissionDenied => {}
            e => warn!(status = status.as_u16(), error = %e, "request failed"),
        }
        let body = json!({ "error": self.0.to_string(), "kind": self.0.kind() });
        (status, Json(body)).into_response()
    }
}
