//! Push repository.

use async_trait::async_trait;
use bpo_core::{CommitInfo, JobId, Push};
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::{DbError, DbResult};

/// Database row for pushes.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PushRow {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub branch: String,
    pub job_id: Option<String>,
}

impl From<PushRow> for Push {
    fn from(row: PushRow) -> Self {
        Push {
            id: row.id,
            date: row.date,
            branch: row.branch,
            job_id: row.job_id.map(JobId::from),
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct CommitRow {
    commit_ref: String,
    message: String,
}

#[async_trait]
pub trait PushRepo: Send + Sync {
    /// Record a push together with its commits, in order.
    async fn create(&self, branch: &str, commits: &[CommitInfo]) -> DbResult<Push>;

    async fn get(&self, id: i64) -> DbResult<Push>;

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Push>>;

    async fn set_job_id(&self, id: i64, job_id: Option<&JobId>) -> DbResult<()>;

    /// Pushes whose get-depends job is still in flight.
    async fn pending(&self) -> DbResult<Vec<Push>>;

    async fn commits(&self, id: i64) -> DbResult<Vec<CommitInfo>>;
}

/// SQLite implementation of PushRepo.
pub struct SqlitePushRepo {
    pool: SqlitePool,
}

impl SqlitePushRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PushRepo for SqlitePushRepo {
    async fn create(&self, branch: &str, commits: &[CommitInfo]) -> DbResult<Push> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PushRow>(
            "INSERT INTO push (date, branch) VALUES (?, ?) RETURNING id, date, branch, job_id",
        )
        .bind(Utc::now())
        .bind(branch)
        .fetch_one(&mut *tx)
        .await?;

        for commit in commits {
            sqlx::query("INSERT INTO push_commit (push_id, ref, message) VALUES (?, ?, ?)")
                .bind(row.id)
                .bind(&commit.r#ref)
                .bind(&commit.message)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(row.into())
    }

    async fn get(&self, id: i64) -> DbResult<Push> {
        let row = sqlx::query_as::<_, PushRow>("SELECT id, date, branch, job_id FROM push WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("push {}", id)))?;
        Ok(row.into())
    }

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Push>> {
        let row = sqlx::query_as::<_, PushRow>(
            "SELECT id, date, branch, job_id FROM push WHERE job_id = ?",
        )
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Push::from))
    }

    async fn set_job_id(&self, id: i64, job_id: Option<&JobId>) -> DbResult<()> {
        let result = sqlx::query("UPDATE push SET job_id = ? WHERE id = ?")
            .bind(job_id.map(JobId::as_str))
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::NotFound(format!("push {}", id)));
        }
        Ok(())
    }

    async fn pending(&self) -> DbResult<Vec<Push>> {
        let rows = sqlx::query_as::<_, PushRow>(
            "SELECT id, date, branch, job_id FROM push WHERE job_id IS NOT NULL ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Push::from).collect())
    }

    async fn commits(&self, id: i64) -> DbResult<Vec<CommitInfo>> {
        let rows = sqlx::query_as::<_, CommitRow>(
            "SELECT ref AS commit_ref, message FROM push_commit WHERE push_id = ? ORDER BY id",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|c| CommitInfo {
                r#ref: c.commit_ref,
                message: c.message,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    #[tokio::test]
    async fn test_push_lifecycle() {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = SqlitePushRepo::new(pool);

        let commits = vec![
            CommitInfo {
                r#ref: "a1".to_string(),
                message: "hello-world: upgrade to 1".to_string(),
            },
            CommitInfo {
                r#ref: "b2".to_string(),
                message: "hello-world-wrapper: new aport".to_string(),
            },
        ];
        let push = repo.create("master", &commits).await.unwrap();
        assert!(push.job_id.is_none());
        assert!(repo.pending().await.unwrap().is_empty());

        let job_id = JobId::from("77");
        repo.set_job_id(push.id, Some(&job_id)).await.unwrap();
        assert_eq!(repo.pending().await.unwrap().len(), 1);
        assert_eq!(
            repo.get_by_job_id(&job_id).await.unwrap().map(|p| p.id),
            Some(push.id)
        );

        repo.set_job_id(push.id, None).await.unwrap();
        assert!(repo.pending().await.unwrap().is_empty());
        assert_eq!(repo.get(push.id).await.unwrap().branch, "master");
        assert_eq!(repo.commits(push.id).await.unwrap(), commits);
        assert!(matches!(repo.set_job_id(999, None).await, Err(DbError::NotFound(_))));
    }
}
