//! Build scheduling for the bpo build coordinator.
//!
//! Turns dependency reports into package rows, dispatches build jobs in
//! dependency order, applies job outcomes and publishes finished batches
//! through the repository manager.

pub mod error;
pub mod images;
pub mod ingest;
pub mod jobs;
pub mod locks;
pub mod outcome;
pub mod scheduler;
pub mod status;
pub mod worker;

#[cfg(test)]
mod testing;

pub use error::{SchedulerError, SchedulerResult};
pub use locks::{KeyedGuard, KeyedLocks};
pub use scheduler::Scheduler;
pub use status::{Badge, StatusSummary};
pub use worker::Worker;
