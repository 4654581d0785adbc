//! API error handling.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bpo_db::DbError;
use bpo_repo::RepoError;
use bpo_scheduler::SchedulerError;
use serde_json::json;
use tracing::error;

/// API error type.
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::Internal(msg) => {
                error!(error = %msg, "Request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };

        let body = Json(json!({
            "error": message
        }));

        (status, body).into_response()
    }
}

impl From<bpo_core::Error> for ApiError {
    fn from(err: bpo_core::Error) -> Self {
        match err {
            bpo_core::Error::NotFound(msg) => ApiError::NotFound(msg),
            bpo_core::Error::InvalidInput(msg) => ApiError::BadRequest(msg),
            bpo_core::Error::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<DbError> for ApiError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound(msg) => ApiError::NotFound(msg),
            DbError::Conflict(msg) => ApiError::Conflict(msg),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<RepoError> for ApiError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::InvalidName(msg) => ApiError::BadRequest(format!("Invalid file name: {}", msg)),
            _ => ApiError::Internal(err.to_string()),
        }
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Core(e) => e.into(),
            SchedulerError::Db(e) => e.into(),
            SchedulerError::Repo(e) => e.into(),
            SchedulerError::MalformedReport(msg) => {
                ApiError::BadRequest(format!("Malformed report: {}", msg))
            }
            SchedulerError::UnknownJob(id) => ApiError::BadRequest(format!("Unknown job: {}", id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheduler_errors_map_to_status() {
        let cases = [
            (
                SchedulerError::UnknownJob("7".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                SchedulerError::MalformedReport("missing section".to_string()),
                StatusCode::BAD_REQUEST,
            ),
            (
                SchedulerError::Db(DbError::Conflict("image".to_string())),
                StatusCode::CONFLICT,
            ),
            (
                SchedulerError::Repo(RepoError::InvalidName("../x.apk".to_string())),
                StatusCode::BAD_REQUEST,
            ),
            (
                SchedulerError::Core(bpo_core::Error::ExecutionFailed("boom".to_string())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            let response = ApiError::from(err).into_response();
            assert_eq!(response.status(), status);
        }
    }
}
