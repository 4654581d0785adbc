//! Push hooks of the pmaports git hosting.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::post;
use axum::{Json, Router};
use bpo_core::PushEvent;
use serde_json::{Value, json};
use tracing::{debug, info};

use crate::AppState;
use crate::auth::{GITLAB_TOKEN_HEADER, verify_token};
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/gitlab", post(gitlab_push_hook))
}

/// Record a push to a configured branch and start its dependency query.
/// Other events and branches are acknowledged and ignored.
async fn gitlab_push_hook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    verify_token(
        &headers,
        GITLAB_TOKEN_HEADER,
        state.config().tokens.push_hook_gitlab.as_deref(),
    )?;

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;

    let Some(event) = PushEvent::from_gitlab_payload(&payload) else {
        debug!("Ignoring GitLab event that is not a push");
        return Ok(Json(json!({ "status": "ignored" })));
    };

    let Some(branch) = event
        .branch
        .as_deref()
        .filter(|b| state.config().branch(b).is_some())
    else {
        info!(git_ref = %event.r#ref, "Ignoring push to a branch that is not configured");
        return Ok(Json(json!({ "status": "ignored" })));
    };

    info!(
        branch,
        commits = event.commits.len(),
        checkout_sha = ?event.checkout_sha,
        "Received GitLab push hook"
    );
    let push = state.scheduler.handle_push(branch, &event.commits).await?;

    Ok(Json(json!({ "status": "ok", "push_id": push.id })))
}
