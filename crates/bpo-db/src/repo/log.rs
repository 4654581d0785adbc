//! Append-only audit log.

use async_trait::async_trait;
use bpo_core::LogEntry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::DbResult;

const LOG_COLUMNS: &str = "id, date, action, payload, arch, branch, pkgname, version, job_id, retry_count, device, ui, dir_name, depend_pkgname, commit_ref";

/// A log entry record from the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct LogRecord {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub action: String,
    pub payload: Option<String>,
    pub arch: Option<String>,
    pub branch: Option<String>,
    pub pkgname: Option<String>,
    pub version: Option<String>,
    pub job_id: Option<String>,
    pub retry_count: Option<i64>,
    pub device: Option<String>,
    pub ui: Option<String>,
    pub dir_name: Option<String>,
    pub depend_pkgname: Option<String>,
    pub commit_ref: Option<String>,
}

#[async_trait]
pub trait LogRepo: Send + Sync {
    async fn append(&self, entry: &LogEntry) -> DbResult<()>;

    /// Newest records first.
    async fn recent(&self, limit: i64) -> DbResult<Vec<LogRecord>>;

    /// All records of one action, oldest first.
    async fn with_action(&self, action: &str) -> DbResult<Vec<LogRecord>>;
}

/// SQLite implementation of LogRepo.
pub struct SqliteLogRepo {
    pool: SqlitePool,
}

impl SqliteLogRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepo for SqliteLogRepo {
    async fn append(&self, entry: &LogEntry) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO log (date, action, payload, arch, branch, pkgname, version, job_id,
                             retry_count, device, ui, dir_name, depend_pkgname, commit_ref)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(Utc::now())
        .bind(&entry.action)
        .bind(entry.payload.as_ref().map(|p| p.to_string()))
        .bind(&entry.arch)
        .bind(&entry.branch)
        .bind(&entry.pkgname)
        .bind(&entry.version)
        .bind(entry.job_id.as_ref().map(|j| j.as_str()))
        .bind(entry.retry_count)
        .bind(&entry.device)
        .bind(&entry.ui)
        .bind(&entry.dir_name)
        .bind(&entry.depend_pkgname)
        .bind(&entry.commit_ref)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent(&self, limit: i64) -> DbResult<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(&format!(
            "SELECT {LOG_COLUMNS} FROM log ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn with_action(&self, action: &str) -> DbResult<Vec<LogRecord>> {
        let records = sqlx::query_as::<_, LogRecord>(&format!(
            "SELECT {LOG_COLUMNS} FROM log WHERE action = ? ORDER BY id"
        ))
        .bind(action)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use bpo_core::JobId;

    #[tokio::test]
    async fn test_append_and_read_back() {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        let repo = SqliteLogRepo::new(pool);

        repo.append(
            &LogEntry::new("api_push_hook_gitlab")
                .with_branch("master")
                .with_commit("abc123")
                .with_payload(serde_json::json!({"object_kind": "push"})),
        )
        .await
        .unwrap();
        repo.append(&LogEntry::new("job_build_package").with_job_id(&JobId::from("1")))
            .await
            .unwrap();

        let recent = repo.recent(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].action, "job_build_package");
        assert_eq!(recent[0].job_id.as_deref(), Some("1"));

        let pushes = repo.with_action("api_push_hook_gitlab").await.unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].commit_ref.as_deref(), Some("abc123"));
        assert_eq!(
            pushes[0].payload.as_deref(),
            Some(r#"{"object_kind":"push"}"#)
        );
        assert_eq!(repo.recent(1).await.unwrap().len(), 1);
    }
}
