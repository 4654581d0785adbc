//! Failure routing and reconciliation with the job backend.
//!
//! Callback-driven backends report outcomes through the `handle_*` entry
//! points. Polled backends, and every backend after a restart, are asked
//! for the status of each job still in flight instead.

use bpo_core::{Error, ImageStatus, JobId, JobStatus, LogEntry, Package, PackageStatus};
use tracing::{info, warn};

use crate::{Scheduler, SchedulerError, SchedulerResult};

impl Scheduler {
    /// Apply a failure outcome to whatever owns the job.
    pub async fn handle_fail(&self, job_id: &JobId) -> SchedulerResult<()> {
        if let Some(package) = self.store.packages.get_by_job_id(job_id).await? {
            return self.handle_package_failure(&package, Some(job_id)).await;
        }
        if let Some(image) = self.store.images.get_by_job_id(job_id).await? {
            return self.handle_image_failure(&image, Some(job_id)).await;
        }
        if let Some(push) = self.store.pushes.get_by_job_id(job_id).await? {
            self.store.pushes.set_job_id(push.id, None).await?;
            self.log(
                LogEntry::new("job_callback_fail")
                    .with_branch(&push.branch)
                    .with_job_id(job_id),
            )
            .await;
            return Ok(());
        }
        Err(SchedulerError::UnknownJob(job_id.to_string()))
    }

    /// Startup recovery. Settles every job left in flight by the last run,
    /// then runs a selection pass for every configured key.
    pub async fn recover(&self) -> SchedulerResult<()> {
        info!(backend = self.backend.name(), "Reconciling jobs from the last run");
        self.update_all_statuses().await?;

        for image in self.store.images.list_with_status(ImageStatus::Queued).await? {
            let _guard = self.image_locks.lock(&image.id).await;
            if let Err(e) = self.start_image(image).await {
                warn!(error = %e, "Failed to start queued image");
            }
        }

        for key in self.config.keys() {
            self.build_key(&key).await?;
        }
        Ok(())
    }

    /// Query the backend for every job still in flight and apply the
    /// outcomes of the finished ones. Errors of a single job are logged and
    /// do not stop the pass.
    pub async fn update_all_statuses(&self) -> SchedulerResult<()> {
        for package in self
            .store
            .packages
            .list_with_status(PackageStatus::Building)
            .await?
        {
            if let Err(e) = self.reconcile_package(&package).await {
                warn!(package = %package, error = %e, "Failed to update package status");
            }
        }

        for image in self
            .store
            .images
            .list_with_status(ImageStatus::Building)
            .await?
        {
            let result = match self.job_status(image.job_id.as_ref()).await {
                JobStatus::Succeeded => match &image.job_id {
                    Some(job_id) => self.handle_build_image(job_id, None).await,
                    None => Ok(()),
                },
                JobStatus::Failed => {
                    self.handle_image_failure(&image, image.job_id.as_ref())
                        .await
                }
                JobStatus::Queued | JobStatus::Building => Ok(()),
            };
            if let Err(e) = result {
                warn!(image = %image, error = %e, "Failed to update image status");
            }
        }

        for push in self.store.pushes.pending().await? {
            let Some(job_id) = push.job_id.clone() else {
                continue;
            };
            let result = match self.job_status(Some(&job_id)).await {
                JobStatus::Succeeded => match self.backend.collect_output(&job_id).await {
                    Ok(files) => self.handle_get_depends(&job_id, &files).await,
                    Err(e) => Err(e.into()),
                },
                JobStatus::Failed => self.handle_fail(&job_id).await,
                JobStatus::Queued | JobStatus::Building => Ok(()),
            };
            if let Err(e) = result {
                warn!(push = push.id, branch = %push.branch, error = %e, "Failed to update dependency query status");
                // An unusable result ends the query.
                if matches!(e, SchedulerError::MalformedReport(_)) {
                    self.handle_fail(&job_id).await?;
                }
            }
        }
        Ok(())
    }

    async fn reconcile_package(&self, package: &Package) -> SchedulerResult<()> {
        match self.job_status(package.job_id.as_ref()).await {
            JobStatus::Succeeded => {
                let Some(job_id) = &package.job_id else {
                    return Ok(());
                };
                let artifacts = self.backend.collect_output(job_id).await?;
                self.handle_build_package(job_id, &artifacts).await
            }
            JobStatus::Failed => {
                self.log(LogEntry::package("job_update_package_status_failed", package))
                    .await;
                self.handle_package_failure(package, package.job_id.as_ref())
                    .await
            }
            JobStatus::Queued | JobStatus::Building => Ok(()),
        }
    }

    /// Status of a job as far as the scheduler is concerned. A missing job
    /// id, or one the backend does not know, is a failed job. Other backend
    /// errors leave the job running until the next pass.
    async fn job_status(&self, job_id: Option<&JobId>) -> JobStatus {
        let Some(job_id) = job_id else {
            return JobStatus::Failed;
        };
        match self.backend.get_status(job_id).await {
            Ok(status) => status,
            Err(Error::NotFound(_)) => {
                warn!(job_id = %job_id, "Backend does not know the job, counting it as failed");
                JobStatus::Failed
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to get job status");
                JobStatus::Building
            }
        }
    }
}
