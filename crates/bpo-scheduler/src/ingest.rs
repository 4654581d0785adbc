//! Pushes, dependency queries and report ingestion.

use bpo_core::{
    BranchArch, CommitInfo, DependencyReport, Error, JobArtifact, JobId, LogEntry, PackageStatus,
    Push, ReportEntry,
};
use bpo_db::UpsertChange;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};

use crate::jobs;
use crate::{Scheduler, SchedulerError, SchedulerResult};

impl Scheduler {
    /// Record a push to a configured branch and query what it needs.
    pub async fn handle_push(&self, branch: &str, commits: &[CommitInfo]) -> SchedulerResult<Push> {
        if self.config.branch(branch).is_none() {
            return Err(Error::InvalidInput(format!("branch is not configured: {}", branch)).into());
        }

        let push = self.store.pushes.create(branch, commits).await?;
        for commit in commits {
            self.log(
                LogEntry::new("api_push_hook_gitlab")
                    .with_branch(branch)
                    .with_commit(&commit.r#ref)
                    .with_payload(json!({ "message": commit.message })),
            )
            .await;
        }
        self.start_get_depends(push).await
    }

    /// Query every configured branch, e.g. after the repository was wiped.
    pub async fn request_repo_missing(&self) -> SchedulerResult<Vec<Push>> {
        let mut pushes = Vec::new();
        for branch in self.config.branch_names() {
            let push = self.store.pushes.create(&branch, &[]).await?;
            self.log(LogEntry::new("get_repo_missing").with_branch(&branch))
                .await;
            pushes.push(self.start_get_depends(push).await?);
        }
        Ok(pushes)
    }

    pub(crate) async fn start_get_depends(&self, push: Push) -> SchedulerResult<Push> {
        let keys = self.config.keys_for_branch(&push.branch);
        let tasks = jobs::get_depends(&push, &keys, self.jobs_submit());
        let job_id = self
            .dispatch(jobs::GET_DEPENDS, Some(&push.branch), tasks)
            .await?;

        self.store.pushes.set_job_id(push.id, Some(&job_id)).await?;
        self.log(
            LogEntry::new("job_get_depends")
                .with_branch(&push.branch)
                .with_job_id(&job_id),
        )
        .await;
        Ok(self.store.pushes.get(push.id).await?)
    }

    /// Apply the result of a `get_depends` job. The uploaded files must
    /// cover exactly the configured arches of the pushed branch.
    pub async fn handle_get_depends(
        &self,
        job_id: &JobId,
        files: &[JobArtifact],
    ) -> SchedulerResult<()> {
        let push = self
            .store
            .pushes
            .get_by_job_id(job_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))?;

        let expected = self.config.keys_for_branch(&push.branch);
        let report = DependencyReport::from_files(files, &expected)
            .map_err(|e| SchedulerError::MalformedReport(e.to_string()))?;

        self.store.pushes.set_job_id(push.id, None).await?;
        self.log(
            LogEntry::new("job_callback_get_depends")
                .with_branch(&push.branch)
                .with_job_id(job_id),
        )
        .await;

        self.ingest_report(&report).await
    }

    /// Bring the stored packages of every key in the report in line with
    /// it, then schedule what became eligible.
    pub async fn ingest_report(&self, report: &DependencyReport) -> SchedulerResult<()> {
        for (key, entries) in report.sections() {
            let _guard = self.locks.lock(key).await;
            self.ingest_key(key, entries).await?;
            self.build_key_locked(key).await?;
        }
        Ok(())
    }

    async fn ingest_key(&self, key: &BranchArch, entries: &[ReportEntry]) -> SchedulerResult<()> {
        info!(key = %key, packages = entries.len(), "Ingesting dependency report");

        for entry in entries {
            let upserted = self
                .store
                .packages
                .upsert(
                    &key.arch,
                    &key.branch,
                    &entry.pkgname,
                    &entry.version,
                    entry.repo.as_deref(),
                    PackageStatus::Queued,
                )
                .await?;
            match upserted.change {
                UpsertChange::Inserted => {
                    self.log(LogEntry::package("package_add", &upserted.package))
                        .await;
                }
                UpsertChange::VersionChanged { old_version } => {
                    self.log(
                        LogEntry::package("package_update_version", &upserted.package)
                            .with_payload(json!({ "old_version": old_version })),
                    )
                    .await;
                }
                UpsertChange::Unchanged => {}
            }
        }

        let wanted: HashSet<&str> = entries.iter().map(|e| e.pkgname.as_str()).collect();
        for package in self.store.packages.list(&key.arch, &key.branch).await? {
            if wanted.contains(package.pkgname.as_str()) {
                continue;
            }
            if self
                .repo
                .final_has(key, &package.pkgname, &package.version)
                .await
            {
                debug!(package = %package, "Not in report, but still in the final repository");
                continue;
            }
            self.store.packages.delete(package.id).await?;
            self.log(LogEntry::package("package_delete", &package)).await;
        }

        // Dependencies that have no row are in the binary repository already.
        let ids: HashMap<String, i64> = self
            .store
            .packages
            .list(&key.arch, &key.branch)
            .await?
            .into_iter()
            .map(|p| (p.pkgname, p.id))
            .collect();
        for entry in entries {
            let Some(&id) = ids.get(&entry.pkgname) else {
                continue;
            };
            let depends: Vec<i64> = entry
                .depends
                .iter()
                .filter_map(|name| ids.get(name).copied())
                .filter(|depend_id| *depend_id != id)
                .collect();
            if self.store.packages.set_depends(id, &depends).await? {
                for name in entry.depends.iter().filter(|n| ids.contains_key(n.as_str())) {
                    self.log(
                        LogEntry::new("package_add_depend")
                            .with_branch(&key.branch)
                            .with_arch(&key.arch)
                            .with_depend(name)
                            .with_payload(json!({ "pkgname": entry.pkgname })),
                    )
                    .await;
                }
            }
        }

        let expected: HashMap<String, String> = entries
            .iter()
            .map(|e| (e.pkgname.clone(), e.version.clone()))
            .collect();
        self.repo.remove_outdated_wip(key, &expected).await?;
        Ok(())
    }
}
