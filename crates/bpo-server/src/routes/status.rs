//! Package counts and the status badge.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use bpo_scheduler::StatusSummary;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/status", get(status))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusSummary>, ApiError> {
    Ok(Json(state.scheduler.status().await?))
}

#[cfg(test)]
mod tests {
    use crate::testing::app;
    use axum::http::StatusCode;
    use bpo_core::{BranchArch, DependencyReport, ReportEntry};
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_status_counts_packages() {
        let app = app().await;
        let (status, body) = app.get("/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["badge"], "up-to-date");

        let entry = ReportEntry {
            pkgname: "hello-world".to_string(),
            version: "1-r4".to_string(),
            repo: Some("main".to_string()),
            depends: vec![],
        };
        let report = DependencyReport::from_sections(BTreeMap::from([(
            BranchArch::new("master", "x86_64"),
            vec![entry],
        )]));
        app.scheduler.ingest_report(&report).await.unwrap();

        let (_, body) = app.get("/api/status").await;
        assert_eq!(body["badge"], "building");
        assert_eq!(body["packages"]["building"], 1);
    }
}
