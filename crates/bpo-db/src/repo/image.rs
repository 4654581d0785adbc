//! Image repository.

use async_trait::async_trait;
use bpo_core::{Image, ImageStatus, JobId};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{DbError, DbResult};

const IMAGE_COLUMNS: &str = "id, date, device, branch, ui, status, job_id, dir_name, retry_count";

/// Database row for images.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ImageRow {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub device: String,
    pub branch: String,
    pub ui: String,
    pub status: String,
    pub job_id: Option<String>,
    pub dir_name: Option<String>,
    pub retry_count: i64,
}

impl TryFrom<ImageRow> for Image {
    type Error = DbError;

    fn try_from(row: ImageRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| DbError::InvalidData(e))?;

        Ok(Image {
            id: row.id,
            date: row.date,
            device: row.device,
            branch: row.branch,
            ui: row.ui,
            status,
            job_id: row.job_id.map(JobId::from),
            dir_name: row.dir_name,
            retry_count: row.retry_count,
        })
    }
}

#[async_trait]
pub trait ImageRepo: Send + Sync {
    /// Queue a new image. Fails with `Conflict` while another row of the
    /// same (device, branch, ui) is queued or building.
    async fn insert(&self, device: &str, branch: &str, ui: &str) -> DbResult<Image>;

    async fn get_by_id(&self, id: i64) -> DbResult<Image>;

    /// The queued or building row of a key, if any.
    async fn get_active(&self, branch: &str, device: &str, ui: &str) -> DbResult<Option<Image>>;

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Image>>;

    /// Change the status. `job_id` and `dir_name` replace the stored values
    /// when given, `date` overrides the row date (completion time).
    async fn set_status(
        &self,
        id: i64,
        status: ImageStatus,
        job_id: Option<&JobId>,
        dir_name: Option<&str>,
        date: Option<DateTime<Utc>>,
    ) -> DbResult<Image>;

    async fn increment_retry_count(&self, id: i64) -> DbResult<i64>;

    async fn list_with_status(&self, status: ImageStatus) -> DbResult<Vec<Image>>;

    /// Number of rows (historical ones included) for a key.
    async fn count(&self, device: &str, branch: &str, ui: &str) -> DbResult<i64>;
}

/// SQLite implementation of ImageRepo.
pub struct SqliteImageRepo {
    pool: SqlitePool,
}

impl SqliteImageRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ImageRepo for SqliteImageRepo {
    async fn insert(&self, device: &str, branch: &str, ui: &str) -> DbResult<Image> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            r#"
            INSERT INTO image (date, device, branch, ui, status, retry_count)
            VALUES (?, ?, ?, ?, 'queued', 0)
            RETURNING {IMAGE_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(device)
        .bind(branch)
        .bind(ui)
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Image> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM image WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("image {}", id)))?;

        row.try_into()
    }

    async fn get_active(&self, branch: &str, device: &str, ui: &str) -> DbResult<Option<Image>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            r#"
            SELECT {IMAGE_COLUMNS} FROM image
            WHERE branch = ? AND device = ? AND ui = ? AND status IN ('queued', 'building')
            "#
        ))
        .bind(branch)
        .bind(device)
        .bind(ui)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Image::try_from).transpose()
    }

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Image>> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM image WHERE job_id = ?"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Image::try_from).transpose()
    }

    async fn set_status(
        &self,
        id: i64,
        status: ImageStatus,
        job_id: Option<&JobId>,
        dir_name: Option<&str>,
        date: Option<DateTime<Utc>>,
    ) -> DbResult<Image> {
        let row = sqlx::query_as::<_, ImageRow>(&format!(
            r#"
            UPDATE image
            SET status = ?, job_id = COALESCE(?, job_id), dir_name = COALESCE(?, dir_name),
                date = COALESCE(?, date)
            WHERE id = ?
            RETURNING {IMAGE_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(job_id.map(JobId::as_str))
        .bind(dir_name)
        .bind(date)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("image {}", id)))?;

        row.try_into()
    }

    async fn increment_retry_count(&self, id: i64) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "UPDATE image SET retry_count = retry_count + 1 WHERE id = ? RETURNING retry_count",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("image {}", id)))?;
        Ok(count)
    }

    async fn list_with_status(&self, status: ImageStatus) -> DbResult<Vec<Image>> {
        let rows = sqlx::query_as::<_, ImageRow>(&format!(
            "SELECT {IMAGE_COLUMNS} FROM image WHERE status = ? ORDER BY id"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Image::try_from).collect()
    }

    async fn count(&self, device: &str, branch: &str, ui: &str) -> DbResult<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM image WHERE device = ? AND branch = ? AND ui = ?")
                .bind(device)
                .bind(branch)
                .bind(ui)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn repo() -> SqliteImageRepo {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteImageRepo::new(pool)
    }

    #[tokio::test]
    async fn test_one_active_row_per_key() {
        let repo = repo().await;
        let image = repo.insert("qemu-amd64", "master", "phosh").await.unwrap();
        assert_eq!(image.status, ImageStatus::Queued);

        let err = repo.insert("qemu-amd64", "master", "phosh").await.unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        // Other keys are independent
        repo.insert("qemu-amd64", "master", "sxmo").await.unwrap();

        repo.set_status(image.id, ImageStatus::Building, Some(&JobId::from("5")), None, None)
            .await
            .unwrap();
        assert!(repo.insert("qemu-amd64", "master", "phosh").await.is_err());

        repo.set_status(image.id, ImageStatus::Published, None, Some("20250101-0000"), None)
            .await
            .unwrap();
        repo.insert("qemu-amd64", "master", "phosh").await.unwrap();
        assert_eq!(repo.count("qemu-amd64", "master", "phosh").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_get_active_ignores_finished_rows() {
        let repo = repo().await;
        let image = repo.insert("pine64-pinephone", "master", "phosh").await.unwrap();

        let active = repo.get_active("master", "pine64-pinephone", "phosh").await.unwrap();
        assert_eq!(active.map(|i| i.id), Some(image.id));

        repo.set_status(image.id, ImageStatus::Failed, None, None, None)
            .await
            .unwrap();
        assert!(repo
            .get_active("master", "pine64-pinephone", "phosh")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_set_status_with_completion_date() {
        let repo = repo().await;
        let image = repo.insert("pine64-pinephone", "master", "phosh").await.unwrap();
        let done = image.date + chrono::Duration::hours(2);

        let published = repo
            .set_status(
                image.id,
                ImageStatus::Published,
                Some(&JobId::from("9")),
                Some("20250101-1200"),
                Some(done),
            )
            .await
            .unwrap();
        assert_eq!(published.date, done);
        assert_eq!(published.dir_name.as_deref(), Some("20250101-1200"));

        let by_job = repo.get_by_job_id(&JobId::from("9")).await.unwrap().unwrap();
        assert_eq!(by_job.id, image.id);
        assert_eq!(repo.increment_retry_count(image.id).await.unwrap(), 1);
        assert_eq!(
            repo.list_with_status(ImageStatus::Published).await.unwrap().len(),
            1
        );
    }
}
