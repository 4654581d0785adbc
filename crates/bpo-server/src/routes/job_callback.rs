//! Callbacks of jobs that upload their own results.
//!
//! Every callback names its job in `X-BPO-Job-Id` and authenticates with
//! the shared job callback token.

use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use bpo_core::{JobArtifact, JobId};
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::AppState;
use crate::auth::{JOB_CALLBACK_TOKEN_HEADER, verify_token};
use crate::error::ApiError;

pub const JOB_ID_HEADER: &str = "X-BPO-Job-Id";
pub const DIR_NAME_HEADER: &str = "X-BPO-Dir-Name";

/// Name of the multipart fields holding uploaded files.
const FILE_FIELD: &str = "file[]";

/// Uploads carry whole packages.
const MAX_UPLOAD_SIZE: usize = 1024 * 1024 * 1024;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/get-depends", post(get_depends))
        .route("/build-package", post(build_package))
        .route("/build-image", post(build_image))
        .route("/fail", post(fail))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE))
}

/// Token check plus the job id every callback carries.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<JobId, ApiError> {
    verify_token(
        headers,
        JOB_CALLBACK_TOKEN_HEADER,
        state.config().tokens.job_callback.as_deref(),
    )?;
    required_header(headers, JOB_ID_HEADER).map(JobId::from)
}

fn required_header<'a>(headers: &'a HeaderMap, name: &str) -> Result<&'a str, ApiError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::BadRequest(format!("Missing {} header", name)))
}

/// Collect the `file[]` fields of a multipart upload.
async fn read_files(mut multipart: Multipart) -> Result<Vec<JobArtifact>, ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(format!("Failed to read field: {}", e)))?
    {
        if field.name() != Some(FILE_FIELD) {
            debug!(field = ?field.name(), "Skipping unknown multipart field");
            continue;
        }
        let name = field
            .file_name()
            .ok_or_else(|| ApiError::BadRequest("File field without file name".to_string()))?
            .to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(format!("Failed to read {}: {}", name, e)))?;
        files.push(JobArtifact::new(name, data));
    }
    Ok(files)
}

/// Dependency reports of a get-depends job, one file per branch and arch.
async fn get_depends(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let job_id = authenticate(&state, &headers)?;
    let files = read_files(multipart).await?;
    info!(job_id = %job_id, files = files.len(), "Received dependency reports");

    state.scheduler.handle_get_depends(&job_id, &files).await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Packages built by a `build_package` job.
async fn build_package(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Value>, ApiError> {
    let job_id = authenticate(&state, &headers)?;
    let files = read_files(multipart).await?;
    info!(job_id = %job_id, files = files.len(), "Received built packages");

    state.scheduler.handle_build_package(&job_id, &files).await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// A `build_image` job finished and published its files under `dir_name`.
async fn build_image(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    let job_id = authenticate(&state, &headers)?;
    let dir_name = required_header(&headers, DIR_NAME_HEADER)?;
    if dir_name.contains('/') || dir_name.starts_with('.') {
        return Err(ApiError::BadRequest(format!(
            "Invalid {} header: {}",
            DIR_NAME_HEADER, dir_name
        )));
    }

    state
        .scheduler
        .handle_build_image(&job_id, Some(dir_name))
        .await?;
    Ok(Json(json!({ "status": "ok" })))
}

/// Any job that failed.
async fn fail(State(state): State<AppState>, headers: HeaderMap) -> Result<Json<Value>, ApiError> {
    let job_id = authenticate(&state, &headers)?;
    info!(job_id = %job_id, "Job reported failure");

    state.scheduler.handle_fail(&job_id).await?;
    Ok(Json(json!({ "status": "ok" })))
}
