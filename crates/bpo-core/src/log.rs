//! Audit log entries.

use serde::{Deserialize, Serialize};

use crate::image::Image;
use crate::package::Package;
use crate::JobId;

/// One audit record. Only `action` is required, every other field is
/// filled in as far as it applies to the action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub action: String,
    pub payload: Option<serde_json::Value>,
    pub arch: Option<String>,
    pub branch: Option<String>,
    pub pkgname: Option<String>,
    pub version: Option<String>,
    pub job_id: Option<JobId>,
    pub retry_count: Option<i64>,
    pub device: Option<String>,
    pub ui: Option<String>,
    pub dir_name: Option<String>,
    pub depend_pkgname: Option<String>,
    pub commit_ref: Option<String>,
}

impl LogEntry {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    /// Entry carrying the identifying fields of a package.
    pub fn package(action: impl Into<String>, package: &Package) -> Self {
        Self {
            action: action.into(),
            arch: Some(package.arch.clone()),
            branch: Some(package.branch.clone()),
            pkgname: Some(package.pkgname.clone()),
            version: Some(package.version.clone()),
            job_id: package.job_id.clone(),
            retry_count: Some(package.retry_count),
            ..Default::default()
        }
    }

    /// Entry carrying the identifying fields of an image.
    pub fn image(action: impl Into<String>, image: &Image) -> Self {
        Self {
            action: action.into(),
            branch: Some(image.branch.clone()),
            device: Some(image.device.clone()),
            ui: Some(image.ui.clone()),
            job_id: image.job_id.clone(),
            dir_name: image.dir_name.clone(),
            retry_count: Some(image.retry_count),
            ..Default::default()
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }

    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = Some(arch.into());
        self
    }

    pub fn with_job_id(mut self, job_id: &JobId) -> Self {
        self.job_id = Some(job_id.clone());
        self
    }

    pub fn with_depend(mut self, pkgname: impl Into<String>) -> Self {
        self.depend_pkgname = Some(pkgname.into());
        self
    }

    pub fn with_commit(mut self, commit_ref: impl Into<String>) -> Self {
        self.commit_ref = Some(commit_ref.into());
        self
    }
}
