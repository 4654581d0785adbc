//! Package counts and the status badge.

use bpo_core::{Package, PackageStatus};
use serde::Serialize;
use std::collections::BTreeMap;

use crate::{Scheduler, SchedulerResult};

/// Overall state shown on the status badge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Badge {
    UpToDate,
    Building,
    Failed,
}

impl Badge {
    pub fn as_str(&self) -> &'static str {
        match self {
            Badge::UpToDate => "up-to-date",
            Badge::Building => "building",
            Badge::Failed => "failed",
        }
    }
}

impl std::fmt::Display for Badge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `failed` counts only failures on branches that are configured and not
/// flagged ignore-errors.
pub fn badge(by_status: &BTreeMap<PackageStatus, Vec<Package>>, failed: i64) -> Badge {
    if failed > 0 {
        return Badge::Failed;
    }
    let busy = [PackageStatus::Queued, PackageStatus::Building]
        .iter()
        .any(|s| by_status.get(s).is_some_and(|p| !p.is_empty()));
    if busy { Badge::Building } else { Badge::UpToDate }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSummary {
    pub packages: BTreeMap<PackageStatus, usize>,
    pub badge: Badge,
}

impl Scheduler {
    pub async fn status(&self) -> SchedulerResult<StatusSummary> {
        let by_status = self.store.packages.packages_by_status().await?;

        let mut exclude = self.config.ignore_errors_branches();
        for branch in self.store.packages.branches().await? {
            if self.config.branch(&branch).is_none() {
                exclude.push(branch);
            }
        }
        let failed = self.store.packages.failed_count(&exclude).await?;

        Ok(StatusSummary {
            badge: badge(&by_status, failed),
            packages: by_status.iter().map(|(s, p)| (*s, p.len())).collect(),
        })
    }
}
