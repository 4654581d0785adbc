//! API routes.

pub mod health;
pub mod job_callback;
pub mod push_hook;
pub mod status;

use crate::AppState;
use axum::Router;

/// Build the main router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/push-hook", push_hook::router())
        .nest("/job-callback", job_callback::router())
        .merge(status::router())
}
