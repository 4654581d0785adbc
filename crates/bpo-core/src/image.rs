//! Image types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Build status of an image. There is no "built" step: images are
/// published as soon as the job completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageStatus {
    Queued,
    Building,
    Published,
    Failed,
}

impl ImageStatus {
    /// Queued and building rows count as the one active row of a key.
    pub fn is_active(&self) -> bool {
        matches!(self, ImageStatus::Queued | ImageStatus::Building)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Queued => "queued",
            ImageStatus::Building => "building",
            ImageStatus::Published => "published",
            ImageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ImageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(ImageStatus::Queued),
            "building" => Ok(ImageStatus::Building),
            "published" => Ok(ImageStatus::Published),
            "failed" => Ok(ImageStatus::Failed),
            _ => Err(format!("Unknown image status: {}", s)),
        }
    }
}

/// One image build for a device, branch and user interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub device: String,
    pub branch: String,
    pub ui: String,
    pub status: ImageStatus,
    pub job_id: Option<JobId>,
    pub dir_name: Option<String>,
    pub retry_count: i64,
}

impl std::fmt::Display for Image {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.branch, self.device, self.ui)
    }
}
