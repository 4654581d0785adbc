//! Push events and the commits they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// A recorded push (or a dependency query without commits). While `job_id` is
/// set, the dependency query for this push is still in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Push {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub branch: String,
    pub job_id: Option<JobId>,
}

/// Commit information attached to a push.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitInfo {
    pub r#ref: String,
    pub message: String,
}

/// Parsed push event data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEvent {
    pub r#ref: String,
    pub branch: Option<String>,
    pub checkout_sha: Option<String>,
    pub commits: Vec<CommitInfo>,
}

impl PushEvent {
    /// Parse a GitLab push hook payload. Returns `None` for other event
    /// kinds or payloads missing the ref.
    pub fn from_gitlab_payload(payload: &serde_json::Value) -> Option<Self> {
        if payload.get("object_kind")?.as_str()? != "push" {
            return None;
        }
        let r#ref = payload.get("ref")?.as_str()?.to_string();
        let branch = r#ref.strip_prefix("refs/heads/").map(str::to_string);
        let checkout_sha = payload
            .get("checkout_sha")
            .and_then(|s| s.as_str())
            .map(str::to_string);

        let commits = payload
            .get("commits")
            .and_then(|c| c.as_array())
            .map(|commits| {
                commits
                    .iter()
                    .filter_map(|c| {
                        Some(CommitInfo {
                            r#ref: c.get("id")?.as_str()?.to_string(),
                            message: c
                                .get("message")
                                .and_then(|m| m.as_str())
                                .unwrap_or_default()
                                .to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            r#ref,
            branch,
            checkout_sha,
            commits,
        })
    }
}
