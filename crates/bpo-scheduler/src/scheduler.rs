//! The package state machine.
//!
//! Every transition of a package happens while holding the lock of its
//! (branch, arch) key, so the callback handlers and the polling worker
//! never race on the same row.

use bpo_config::SystemConfig;
use bpo_core::{
    BranchArch, JobArtifact, JobBackend, JobId, JobTasks, LogEntry, Package, PackageStatus,
};
use bpo_db::Store;
use bpo_repo::RepoManager;
use serde_json::json;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::jobs;
use crate::locks::KeyedLocks;
use crate::{SchedulerError, SchedulerResult};

/// Drives packages, images and dependency queries through their jobs.
pub struct Scheduler {
    pub(crate) store: Store,
    pub(crate) backend: Arc<dyn JobBackend>,
    pub(crate) repo: RepoManager,
    pub(crate) config: Arc<SystemConfig>,
    pub(crate) locks: KeyedLocks<BranchArch>,
    pub(crate) image_locks: KeyedLocks<i64>,
}

impl Scheduler {
    pub fn new(
        store: Store,
        backend: Arc<dyn JobBackend>,
        repo: RepoManager,
        config: Arc<SystemConfig>,
    ) -> Self {
        Self {
            store,
            backend,
            repo,
            config,
            locks: KeyedLocks::new(),
            image_locks: KeyedLocks::new(),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    /// Record an audit entry. Failing to store it never fails the caller.
    pub(crate) async fn log(&self, entry: LogEntry) {
        info!(
            branch = entry.branch.as_deref().unwrap_or(""),
            arch = entry.arch.as_deref().unwrap_or(""),
            pkgname = entry.pkgname.as_deref().unwrap_or(""),
            job_id = entry.job_id.as_ref().map(JobId::as_str).unwrap_or(""),
            "{}",
            entry.action
        );
        if let Err(e) = self.store.logs.append(&entry).await {
            warn!(action = %entry.action, error = %e, "Failed to store log entry");
        }
    }

    /// Whether jobs have to upload their results themselves.
    pub(crate) fn jobs_submit(&self) -> bool {
        !self.backend.requires_polling()
    }

    /// Submit a job with the backend's setup task in front.
    pub(crate) async fn dispatch(
        &self,
        name: &str,
        branch: Option<&str>,
        mut tasks: JobTasks,
    ) -> SchedulerResult<JobId> {
        tasks.prepend("setup", &self.backend.script_setup(branch));
        let job_id = self.backend.run_job(name, &tasks).await?;
        debug!(job = name, job_id = %job_id, backend = self.backend.name(), "Dispatched job");
        Ok(job_id)
    }

    fn retry_count_max(&self) -> i64 {
        i64::from(self.config.retry_count_max)
    }

    /// Run a selection pass for one key.
    pub async fn build_key(&self, key: &BranchArch) -> SchedulerResult<()> {
        let _guard = self.locks.lock(key).await;
        self.build_key_locked(key).await
    }

    /// Dispatch every eligible package, then publish the key if nothing is
    /// left to do. The caller holds the key lock.
    pub(crate) async fn build_key_locked(&self, key: &BranchArch) -> SchedulerResult<()> {
        while let Some(package) = self.next_eligible(key).await? {
            self.start_package(package).await?;
        }
        self.publish_if_complete(key).await
    }

    /// The oldest queued package whose dependencies are all built or
    /// published.
    async fn next_eligible(&self, key: &BranchArch) -> SchedulerResult<Option<Package>> {
        let packages = self.store.packages.list(&key.arch, &key.branch).await?;
        for package in packages {
            if package.status != PackageStatus::Queued {
                continue;
            }
            let depends = self.store.packages.depends(package.id).await?;
            if depends.iter().all(|d| d.status.is_resolved()) {
                return Ok(Some(package));
            }
            debug!(package = %package, "Waiting for dependencies");
        }
        Ok(None)
    }

    /// Dispatch the build job of a package. A dispatch error counts as a
    /// failed attempt.
    pub(crate) async fn start_package(&self, mut package: Package) -> SchedulerResult<Package> {
        loop {
            let tasks = jobs::build_package(&package, self.jobs_submit());
            match self
                .dispatch(jobs::BUILD_PACKAGE, Some(&package.branch), tasks)
                .await
            {
                Ok(job_id) => {
                    let package = self
                        .store
                        .packages
                        .set_status(package.id, PackageStatus::Building, Some(&job_id))
                        .await?;
                    self.log(LogEntry::package("job_build_package", &package))
                        .await;
                    return Ok(package);
                }
                Err(e) => {
                    warn!(package = %package, error = %e, "Failed to dispatch build job");
                    match self.count_failure(&package).await? {
                        Some(retry) => package = retry,
                        None => {
                            let package = self.store.packages.get_by_id(package.id).await?;
                            return Ok(package);
                        }
                    }
                }
            }
        }
    }

    /// Count a failed attempt. Returns the package if it gets another try,
    /// `None` once it stays failed.
    async fn count_failure(&self, package: &Package) -> SchedulerResult<Option<Package>> {
        let retry_count = self.store.packages.increment_retry_count(package.id).await?;
        if retry_count < self.retry_count_max() {
            let package = self.store.packages.get_by_id(package.id).await?;
            self.log(LogEntry::package("job_callback_fail_retry", &package))
                .await;
            Ok(Some(package))
        } else {
            let package = self
                .store
                .packages
                .set_status(package.id, PackageStatus::Failed, None)
                .await?;
            self.log(LogEntry::package("job_callback_fail", &package))
                .await;
            Ok(None)
        }
    }

    /// Promote the built packages of a key once nothing else is pending.
    async fn publish_if_complete(&self, key: &BranchArch) -> SchedulerResult<()> {
        let packages = self.store.packages.list(&key.arch, &key.branch).await?;
        let pending = packages.iter().any(|p| {
            matches!(
                p.status,
                PackageStatus::Queued | PackageStatus::Building | PackageStatus::Failed
            )
        });
        let batch: Vec<Package> = packages
            .into_iter()
            .filter(|p| p.status == PackageStatus::Built)
            .collect();
        if pending || batch.is_empty() {
            return Ok(());
        }

        match self.repo.promote(key, &batch).await {
            Ok(promotion) => {
                for package in &batch {
                    self.store
                        .packages
                        .set_status(package.id, PackageStatus::Published, None)
                        .await?;
                }
                self.log(
                    LogEntry::new("repo_publish")
                        .with_branch(&key.branch)
                        .with_arch(&key.arch)
                        .with_payload(json!({
                            "promoted": promotion.promoted,
                            "removed": promotion.removed,
                        })),
                )
                .await;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Promotion failed, batch stays built");
                self.log(
                    LogEntry::new("repo_publish_failed")
                        .with_branch(&key.branch)
                        .with_arch(&key.arch)
                        .with_payload(json!({ "error": e.to_string() })),
                )
                .await;
            }
        }
        Ok(())
    }

    /// Apply the success outcome of a `build_package` job.
    pub async fn handle_build_package(
        &self,
        job_id: &JobId,
        artifacts: &[JobArtifact],
    ) -> SchedulerResult<()> {
        let package = self.package_for_job(job_id).await?;
        let key = package.key();
        let _guard = self.locks.lock(&key).await;

        let Some(package) = self.current_build(&package, job_id).await? else {
            return Ok(());
        };

        let wanted = self.expected_apks(&key).await?;
        self.repo.stage(&key, artifacts, &wanted).await?;
        if !self.repo.wip_has(&key, &package.pkgname, &package.version).await {
            warn!(package = %package, "Job succeeded without uploading the package");
            self.log(
                LogEntry::package("job_callback_build_package_missing", &package)
                    .with_payload(json!({ "expected": package.apk_name() })),
            )
            .await;
            self.fail_package_locked(&package).await?;
        } else {
            let package = self
                .store
                .packages
                .set_status(package.id, PackageStatus::Built, None)
                .await?;
            self.log(LogEntry::package("job_callback_build_package", &package))
                .await;
        }

        self.build_key_locked(&key).await
    }

    /// Apk names of the key's queued, building and built packages at their
    /// current version. Uploads are limited to these.
    async fn expected_apks(&self, key: &BranchArch) -> SchedulerResult<BTreeSet<String>> {
        Ok(self
            .store
            .packages
            .list(&key.arch, &key.branch)
            .await?
            .iter()
            .filter(|p| {
                matches!(
                    p.status,
                    PackageStatus::Queued | PackageStatus::Building | PackageStatus::Built
                )
            })
            .map(Package::apk_name)
            .collect())
    }

    /// Apply the failure outcome of a package job.
    pub(crate) async fn handle_package_failure(
        &self,
        package: &Package,
        job_id: Option<&JobId>,
    ) -> SchedulerResult<()> {
        let key = package.key();
        let _guard = self.locks.lock(&key).await;

        let package = self.store.packages.get_by_id(package.id).await?;
        if package.status != PackageStatus::Building || package.job_id.as_ref() != job_id {
            debug!(package = %package, "Ignoring failure of an outdated job");
            return Ok(());
        }

        self.fail_package_locked(&package).await?;
        self.build_key_locked(&key).await
    }

    async fn fail_package_locked(&self, package: &Package) -> SchedulerResult<()> {
        if let Some(retry) = self.count_failure(package).await? {
            self.start_package(retry).await?;
        }
        Ok(())
    }

    pub(crate) async fn package_for_job(&self, job_id: &JobId) -> SchedulerResult<Package> {
        self.store
            .packages
            .get_by_job_id(job_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))
    }

    /// Re-read a package under its key lock. `None` if it is no longer
    /// building this job, e.g. for a duplicate callback.
    async fn current_build(
        &self,
        package: &Package,
        job_id: &JobId,
    ) -> SchedulerResult<Option<Package>> {
        let package = self.store.packages.get_by_id(package.id).await?;
        if package.status != PackageStatus::Building || package.job_id.as_ref() != Some(job_id) {
            info!(package = %package, job_id = %job_id, "Ignoring outcome of an outdated job");
            self.log(
                LogEntry::package("job_callback_ignored", &package).with_job_id(job_id),
            )
            .await;
            return Ok(None);
        }
        Ok(Some(package))
    }

    /// Ask the backend to stop the build of a package. The package status is
    /// left alone.
    pub async fn abort(&self, package: &Package) -> SchedulerResult<()> {
        self.log(LogEntry::package("abort_package", package)).await;
        if let Some(job_id) = &package.job_id {
            self.backend.abort(job_id).await?;
        }
        Ok(())
    }
}
