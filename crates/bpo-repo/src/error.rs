//! Repository error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("tool archive: {0}")]
    ToolArchive(String),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("invalid file name: {0}")]
    InvalidName(String),

    #[error("{tool} failed: {message}")]
    Tool { tool: String, message: String },
}

impl RepoError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> RepoError {
        let path = path.into();
        move |source| RepoError::Io { path, source }
    }
}

impl From<RepoError> for bpo_core::Error {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::MissingArtifact(msg) => bpo_core::Error::NotFound(msg),
            RepoError::InvalidName(msg) => bpo_core::Error::InvalidInput(msg),
            other => bpo_core::Error::Internal(other.to_string()),
        }
    }
}

pub type RepoResult<T> = std::result::Result<T, RepoError>;
