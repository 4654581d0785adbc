//! Job backend trait and job types.
//!
//! A job is a named list of shell task scripts. Backends run them either
//! in-process (polled for completion) or on a remote CI system (which calls
//! back when it is done).

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{JobId, Result};

/// Status of a job as reported by its backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job is waiting to start.
    Queued,
    /// Job is currently running.
    Building,
    /// Job completed successfully.
    Succeeded,
    /// Job failed, timed out or was cancelled.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

/// Ordered task scripts of one job. Order is execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobTasks(Vec<(String, String)>);

impl JobTasks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task. The script is normalized on the way in.
    pub fn push(&mut self, name: impl Into<String>, script: &str) {
        self.0.push((name.into(), normalize_script(script)));
    }

    /// Same as `push`, but the task runs before all others.
    pub fn prepend(&mut self, name: impl Into<String>, script: &str) {
        self.0.insert(0, (name.into(), normalize_script(script)));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, s)| (n.as_str(), s.as_str()))
    }

    pub fn names(&self) -> Vec<&str> {
        self.0.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A file produced by a job (binary package, dependency report, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct JobArtifact {
    pub name: String,
    pub data: Bytes,
}

impl JobArtifact {
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Trait for job backends.
#[async_trait]
pub trait JobBackend: Send + Sync {
    /// Name of this backend.
    fn name(&self) -> &'static str;

    /// Bootstrap script that runs as the first task of every job.
    fn script_setup(&self, branch: Option<&str>) -> String;

    /// Submit a job and return the id used for all later correlation.
    async fn run_job(&self, name: &str, tasks: &JobTasks) -> Result<JobId>;

    /// Get the current status of a job.
    async fn get_status(&self, job_id: &JobId) -> Result<JobStatus>;

    /// Web link to the build log.
    fn get_link(&self, job_id: &JobId) -> String;

    /// Whether job completion has to be observed by polling `get_status`
    /// instead of waiting for callbacks.
    fn requires_polling(&self) -> bool {
        false
    }

    /// Files a finished job left behind. Backends that push their results
    /// through callbacks have nothing to collect.
    async fn collect_output(&self, _job_id: &JobId) -> Result<Vec<JobArtifact>> {
        Ok(Vec::new())
    }

    /// Stop a running job. Without backend support this only logs.
    async fn abort(&self, job_id: &JobId) -> Result<()> {
        info!(backend = self.name(), job_id = %job_id, "Abort requested, not supported by backend");
        Ok(())
    }
}

/// Clean up an embedded shell script before it is handed to a backend.
///
/// Leading blank lines are dropped, the indentation shared by all
/// non-blank lines is removed and trailing blank lines are dropped. The
/// result ends with exactly one newline (or is empty).
pub fn normalize_script(script: &str) -> String {
    let lines: Vec<&str> = script
        .split('\n')
        .skip_while(|line| line.trim().is_empty())
        .collect();

    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start_matches(' ').len())
        .min()
        .unwrap_or(0);

    let mut ret = String::new();
    for line in lines {
        if line.trim().is_empty() {
            ret.push('\n');
        } else {
            ret.push_str(&line[indent..]);
            ret.push('\n');
        }
    }

    while ret.ends_with("\n\n") {
        ret.pop();
    }
    if ret == "\n" {
        ret.clear();
    }
    ret
}

/// Quote a value for a task script. Values shlex cannot quote, such as
/// those with a NUL byte, become an empty argument `''`.
pub fn shell_quote(value: &str) -> String {
    shlex::try_quote(value)
        .map(|quoted| quoted.into_owned())
        .unwrap_or_else(|_| "''".to_string())
}
