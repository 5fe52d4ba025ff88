//! Error taxonomy shared by every orchestration component.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed project data or an unsafe path. Nothing was written.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The sandboxed build exited non-zero.
    #[error("Build failed: {message}")]
    BuildFailure { message: String, stderr: String },

    /// Workspace, sandbox or relocation plumbing failed.
    #[error("Infrastructure error: {0}")]
    Infrastructure(String),

    /// Duplicate registration of a session id.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn infra(context: &str, err: impl std::fmt::Display) -> Self {
        Self::Infrastructure(format!("{}: {}", context, err))
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Self::BuildFailure { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Infrastructure(_) | Self::Conflict(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stderr: Option<String>,
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let stderr = match &self {
            Self::BuildFailure { stderr, .. } => Some(stderr.clone()),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            stderr,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_taxonomy() {
        assert_eq!(
            OrchestratorError::InvalidInput("x".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrchestratorError::BuildFailure {
                message: "exit 1".into(),
                stderr: "boom".into()
            }
            .status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            OrchestratorError::NotFound("s".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrchestratorError::Conflict("s".into()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn infra_keeps_underlying_cause() {
        let err = OrchestratorError::infra("mkdir", "permission denied");
        assert_eq!(err.to_string(), "Infrastructure error: mkdir: permission denied");
    }
}
