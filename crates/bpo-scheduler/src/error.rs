//! Scheduler error types.

use bpo_db::DbError;
use bpo_repo::RepoError;
use thiserror::Error;

/// Errors raised while scheduling and applying job outcomes.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Core(#[from] bpo_core::Error),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("repository error: {0}")]
    Repo(#[from] RepoError),

    /// A dependency report that does not match the expected sections.
    #[error("malformed report: {0}")]
    MalformedReport(String),

    /// No package, image or push owns this job id.
    #[error("unknown job: {0}")]
    UnknownJob(String),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
