//! Image builds.
//!
//! Images have no dependencies and no promotion step. A successful job
//! publishes the image right away.

use bpo_core::{Error, Image, ImageStatus, JobId, LogEntry};
use bpo_db::DbError;
use chrono::Utc;
use tracing::{debug, warn};

use crate::jobs;
use crate::{Scheduler, SchedulerError, SchedulerResult};

impl Scheduler {
    /// Queue and start an image build. Returns `None` if the same image is
    /// already queued or building.
    pub async fn queue_image(
        &self,
        branch: &str,
        device: &str,
        ui: &str,
    ) -> SchedulerResult<Option<Image>> {
        if self.config.branch(branch).is_none() {
            return Err(Error::InvalidInput(format!("branch is not configured: {}", branch)).into());
        }

        let image = match self.store.images.insert(device, branch, ui).await {
            Ok(image) => image,
            Err(DbError::Conflict(_)) => {
                debug!(branch, device, ui, "Image is already in progress");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.log(LogEntry::image("image_queue", &image)).await;

        let _guard = self.image_locks.lock(&image.id).await;
        self.start_image(image).await.map(Some)
    }

    /// Dispatch the job of an image. Dispatch errors count as failures.
    pub(crate) async fn start_image(&self, mut image: Image) -> SchedulerResult<Image> {
        loop {
            let dir_name = Utc::now().format("%Y%m%d-%H%M").to_string();
            let tasks = jobs::build_image(&image, &dir_name, self.jobs_submit());
            match self
                .dispatch(jobs::BUILD_IMAGE, Some(&image.branch), tasks)
                .await
            {
                Ok(job_id) => {
                    let image = self
                        .store
                        .images
                        .set_status(
                            image.id,
                            ImageStatus::Building,
                            Some(&job_id),
                            Some(&dir_name),
                            None,
                        )
                        .await?;
                    self.log(LogEntry::image("job_build_image", &image)).await;
                    return Ok(image);
                }
                Err(e) => {
                    warn!(image = %image, error = %e, "Failed to dispatch image job");
                    match self.count_image_failure(&image).await? {
                        Some(retry) => image = retry,
                        None => return Ok(self.store.images.get_by_id(image.id).await?),
                    }
                }
            }
        }
    }

    async fn count_image_failure(&self, image: &Image) -> SchedulerResult<Option<Image>> {
        let retry_count = self.store.images.increment_retry_count(image.id).await?;
        if retry_count < i64::from(self.config.retry_count_max) {
            let image = self.store.images.get_by_id(image.id).await?;
            self.log(LogEntry::image("job_callback_fail_retry", &image))
                .await;
            Ok(Some(image))
        } else {
            let image = self
                .store
                .images
                .set_status(image.id, ImageStatus::Failed, None, None, None)
                .await?;
            self.log(LogEntry::image("job_callback_fail", &image)).await;
            Ok(None)
        }
    }

    /// Apply the success outcome of a `build_image` job. `dir_name` replaces
    /// the directory picked at dispatch when given.
    pub async fn handle_build_image(
        &self,
        job_id: &JobId,
        dir_name: Option<&str>,
    ) -> SchedulerResult<()> {
        let image = self.image_for_job(job_id).await?;
        let _guard = self.image_locks.lock(&image.id).await;

        let image = self.store.images.get_by_id(image.id).await?;
        if image.status != ImageStatus::Building || image.job_id.as_ref() != Some(job_id) {
            debug!(image = %image, job_id = %job_id, "Ignoring outcome of an outdated job");
            return Ok(());
        }

        let image = self
            .store
            .images
            .set_status(
                image.id,
                ImageStatus::Published,
                None,
                dir_name,
                Some(Utc::now()),
            )
            .await?;
        self.log(LogEntry::image("job_callback_build_image", &image))
            .await;
        Ok(())
    }

    pub(crate) async fn handle_image_failure(
        &self,
        image: &Image,
        job_id: Option<&JobId>,
    ) -> SchedulerResult<()> {
        let _guard = self.image_locks.lock(&image.id).await;

        let image = self.store.images.get_by_id(image.id).await?;
        if image.status != ImageStatus::Building || image.job_id.as_ref() != job_id {
            debug!(image = %image, "Ignoring failure of an outdated job");
            return Ok(());
        }

        if let Some(retry) = self.count_image_failure(&image).await? {
            self.start_image(retry).await?;
        }
        Ok(())
    }

    pub(crate) async fn image_for_job(&self, job_id: &JobId) -> SchedulerResult<Image> {
        self.store
            .images
            .get_by_job_id(job_id)
            .await?
            .ok_or_else(|| SchedulerError::UnknownJob(job_id.to_string()))
    }
}
