//! Dashboard error types and their HTTP mapping.

use axum::{
    Json,
    extract::rejection::{JsonRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

use jobmill_protocols::JobError;

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed id, filter or request body.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The job's current state does not allow the action.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Storage is unreachable; the caller may retry.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DashboardError {
    pub fn status(&self) -> StatusCode {
        match self {
            DashboardError::NotFound(_) => StatusCode::NOT_FOUND,
            DashboardError::BadRequest(_) => StatusCode::BAD_REQUEST,
            DashboardError::Conflict(_) => StatusCode::CONFLICT,
            DashboardError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            DashboardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<JobError> for DashboardError {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(m) => DashboardError::NotFound(m),
            JobError::InvalidOperation(m) => DashboardError::Conflict(m),
            JobError::StorageUnavailable(m) => DashboardError::Unavailable(m),
            JobError::InvalidCron(_)
            | JobError::Deserialization(_)
            | JobError::UnknownCapability { .. } => DashboardError::BadRequest(err.to_string()),
            other => DashboardError::Internal(other.to_string()),
        }
    }
}

impl From<JsonRejection> for DashboardError {
    fn from(rejection: JsonRejection) -> Self {
        DashboardError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for DashboardError {
    fn from(rejection: QueryRejection) -> Self {
        DashboardError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for DashboardError {
    fn into_response(self) -> Response {
        (self.status(), Json(json!({ "error": self.to_string() }))).into_response()
    }
}
