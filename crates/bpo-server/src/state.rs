//! Application state.

use bpo_config::SystemConfig;
use bpo_scheduler::Scheduler;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    pub fn new(scheduler: Arc<Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn config(&self) -> &SystemConfig {
        self.scheduler.config()
    }
}
