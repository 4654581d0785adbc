//! Polling loop for job backends that do not call back.

use crate::Scheduler;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Periodically settles finished jobs through the scheduler.
pub struct Worker {
    scheduler: Arc<Scheduler>,
    interval: Duration,
}

impl Worker {
    pub fn new(scheduler: Arc<Scheduler>, interval: Duration) -> Self {
        Self {
            scheduler,
            interval,
        }
    }

    /// Run the polling loop.
    pub async fn run(&self) {
        info!(
            backend = self.scheduler.backend().name(),
            interval_secs = self.interval.as_secs(),
            "Starting job status worker"
        );

        loop {
            if let Err(e) = self.scheduler.update_all_statuses().await {
                warn!(error = %e, "Failed to update job statuses");
            }
            sleep(self.interval).await;
        }
    }
}
