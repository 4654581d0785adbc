//! Package types and the package status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::JobId;

/// Build status of a package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageStatus {
    Queued,
    Building,
    Built,
    Published,
    Failed,
}

impl PackageStatus {
    pub const ALL: [PackageStatus; 5] = [
        PackageStatus::Queued,
        PackageStatus::Building,
        PackageStatus::Built,
        PackageStatus::Published,
        PackageStatus::Failed,
    ];

    /// Whether a package in this status satisfies a dependency edge.
    pub fn is_resolved(&self) -> bool {
        matches!(self, PackageStatus::Built | PackageStatus::Published)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageStatus::Queued => "queued",
            PackageStatus::Building => "building",
            PackageStatus::Built => "built",
            PackageStatus::Published => "published",
            PackageStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(PackageStatus::Queued),
            "building" => Ok(PackageStatus::Building),
            "built" => Ok(PackageStatus::Built),
            "published" => Ok(PackageStatus::Published),
            "failed" => Ok(PackageStatus::Failed),
            _ => Err(format!("Unknown package status: {}", s)),
        }
    }
}

/// A (branch, architecture) pair. Scheduling, locking and promotion are
/// all scoped to one of these.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BranchArch {
    pub branch: String,
    pub arch: String,
}

impl BranchArch {
    pub fn new(branch: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            branch: branch.into(),
            arch: arch.into(),
        }
    }
}

impl std::fmt::Display for BranchArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.branch, self.arch)
    }
}

/// One package of one branch and architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub arch: String,
    pub branch: String,
    pub pkgname: String,
    pub version: String,
    pub repo: Option<String>,
    pub status: PackageStatus,
    pub job_id: Option<JobId>,
    pub retry_count: i64,
}

impl Package {
    pub fn key(&self) -> BranchArch {
        BranchArch::new(&self.branch, &self.arch)
    }

    /// File name of the main binary package built from this row.
    pub fn apk_name(&self) -> String {
        apk_name(&self.pkgname, &self.version)
    }
}

impl std::fmt::Display for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}-{}@{}",
            self.arch,
            self.repo.as_deref().unwrap_or("?"),
            self.pkgname,
            self.version,
            self.branch
        )
    }
}

pub fn apk_name(pkgname: &str, version: &str) -> String {
    format!("{}-{}.apk", pkgname, version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolved_statuses() {
        let resolved: Vec<_> = PackageStatus::ALL
            .iter()
            .filter(|s| s.is_resolved())
            .collect();
        assert_eq!(resolved, vec![&PackageStatus::Built, &PackageStatus::Published]);
    }

    #[test]
    fn test_status_roundtrip_through_text() {
        for status in PackageStatus::ALL {
            assert_eq!(status.to_string().parse::<PackageStatus>(), Ok(status));
        }
        assert!("done".parse::<PackageStatus>().is_err());
    }

    #[test]
    fn test_apk_name() {
        assert_eq!(apk_name("hello-world", "1-r4"), "hello-world-1-r4.apk");
    }
}
