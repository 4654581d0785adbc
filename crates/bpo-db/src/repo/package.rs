//! Package repository and dependency edges.

use async_trait::async_trait;
use bpo_core::{JobId, Package, PackageStatus};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use std::collections::{BTreeMap, BTreeSet};

use crate::{DbError, DbResult};

const PACKAGE_COLUMNS: &str = "id, date, last_update, arch, branch, pkgname, version, repo, status, job_id, retry_count";

/// Database row for packages.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PackageRow {
    pub id: i64,
    pub date: DateTime<Utc>,
    pub last_update: Option<DateTime<Utc>>,
    pub arch: String,
    pub branch: String,
    pub pkgname: String,
    pub version: String,
    pub repo: Option<String>,
    pub status: String,
    pub job_id: Option<String>,
    pub retry_count: i64,
}

impl TryFrom<PackageRow> for Package {
    type Error = DbError;

    fn try_from(row: PackageRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse()
            .map_err(|e: String| DbError::InvalidData(e))?;

        Ok(Package {
            id: row.id,
            date: row.date,
            last_update: row.last_update,
            arch: row.arch,
            branch: row.branch,
            pkgname: row.pkgname,
            version: row.version,
            repo: row.repo,
            status,
            job_id: row.job_id.map(JobId::from),
            retry_count: row.retry_count,
        })
    }
}

/// What an upsert did to the stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertChange {
    Inserted,
    /// The version changed. Status, job and retry count were reset.
    VersionChanged { old_version: String },
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct Upserted {
    pub package: Package,
    pub change: UpsertChange,
}

#[async_trait]
pub trait PackageRepo: Send + Sync {
    async fn get(&self, pkgname: &str, arch: &str, branch: &str) -> DbResult<Option<Package>>;

    async fn get_by_id(&self, id: i64) -> DbResult<Package>;

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Package>>;

    /// Insert a new row. Fails with `Conflict` if the triple exists.
    async fn insert(
        &self,
        arch: &str,
        branch: &str,
        pkgname: &str,
        version: &str,
        repo: Option<&str>,
        status: PackageStatus,
    ) -> DbResult<Package>;

    /// Insert, or bring an existing row to `version`. A version change
    /// requeues the package from scratch.
    async fn upsert(
        &self,
        arch: &str,
        branch: &str,
        pkgname: &str,
        version: &str,
        repo: Option<&str>,
        status: PackageStatus,
    ) -> DbResult<Upserted>;

    /// Change the status. `job_id` replaces the stored job when given.
    async fn set_status(
        &self,
        id: i64,
        status: PackageStatus,
        job_id: Option<&JobId>,
    ) -> DbResult<Package>;

    async fn clear_job_id(&self, id: i64) -> DbResult<()>;

    /// Returns the new retry count.
    async fn increment_retry_count(&self, id: i64) -> DbResult<i64>;

    async fn delete(&self, id: i64) -> DbResult<()>;

    /// All packages grouped by status. Every status is present as a key.
    async fn packages_by_status(&self) -> DbResult<BTreeMap<PackageStatus, Vec<Package>>>;

    /// Packages of one (arch, branch), in creation order.
    async fn list(&self, arch: &str, branch: &str) -> DbResult<Vec<Package>>;

    async fn list_with_status(&self, status: PackageStatus) -> DbResult<Vec<Package>>;

    /// Distinct branch names that have packages.
    async fn branches(&self) -> DbResult<Vec<String>>;

    /// Number of failed packages outside the given branches.
    async fn failed_count(&self, exclude_branches: &[String]) -> DbResult<i64>;

    /// Replace the dependency edges of a package. Returns whether the edge
    /// set changed.
    async fn set_depends(&self, id: i64, dependency_ids: &[i64]) -> DbResult<bool>;

    /// Packages this package depends on.
    async fn depends(&self, id: i64) -> DbResult<Vec<Package>>;

    /// Packages that depend on this package.
    async fn required_by(&self, id: i64) -> DbResult<Vec<Package>>;
}

/// SQLite implementation of PackageRepo.
pub struct SqlitePackageRepo {
    pool: SqlitePool,
}

impl SqlitePackageRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn fetch_all(&self, query: String, binds: &[&str]) -> DbResult<Vec<Package>> {
        let mut q = sqlx::query_as::<_, PackageRow>(&query);
        for bind in binds {
            q = q.bind(*bind);
        }
        q.fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Package::try_from)
            .collect()
    }
}

#[async_trait]
impl PackageRepo for SqlitePackageRepo {
    async fn get(&self, pkgname: &str, arch: &str, branch: &str) -> DbResult<Option<Package>> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM package WHERE pkgname = ? AND arch = ? AND branch = ?"
        ))
        .bind(pkgname)
        .bind(arch)
        .bind(branch)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Package::try_from).transpose()
    }

    async fn get_by_id(&self, id: i64) -> DbResult<Package> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM package WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("package {}", id)))?;

        row.try_into()
    }

    async fn get_by_job_id(&self, job_id: &JobId) -> DbResult<Option<Package>> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM package WHERE job_id = ?"
        ))
        .bind(job_id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Package::try_from).transpose()
    }

    async fn insert(
        &self,
        arch: &str,
        branch: &str,
        pkgname: &str,
        version: &str,
        repo: Option<&str>,
        status: PackageStatus,
    ) -> DbResult<Package> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            r#"
            INSERT INTO package (date, arch, branch, pkgname, version, repo, status, retry_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, 0)
            RETURNING {PACKAGE_COLUMNS}
            "#
        ))
        .bind(Utc::now())
        .bind(arch)
        .bind(branch)
        .bind(pkgname)
        .bind(version)
        .bind(repo)
        .bind(status.as_str())
        .fetch_one(&self.pool)
        .await?;

        row.try_into()
    }

    async fn upsert(
        &self,
        arch: &str,
        branch: &str,
        pkgname: &str,
        version: &str,
        repo: Option<&str>,
        status: PackageStatus,
    ) -> DbResult<Upserted> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS} FROM package WHERE pkgname = ? AND arch = ? AND branch = ?"
        ))
        .bind(pkgname)
        .bind(arch)
        .bind(branch)
        .fetch_optional(&mut *tx)
        .await?;

        let (row, change) = match existing {
            None => {
                let row = sqlx::query_as::<_, PackageRow>(&format!(
                    r#"
                    INSERT INTO package (date, arch, branch, pkgname, version, repo, status, retry_count)
                    VALUES (?, ?, ?, ?, ?, ?, ?, 0)
                    RETURNING {PACKAGE_COLUMNS}
                    "#
                ))
                .bind(Utc::now())
                .bind(arch)
                .bind(branch)
                .bind(pkgname)
                .bind(version)
                .bind(repo)
                .bind(status.as_str())
                .fetch_one(&mut *tx)
                .await?;
                (row, UpsertChange::Inserted)
            }
            Some(old) if old.version != version => {
                let row = sqlx::query_as::<_, PackageRow>(&format!(
                    r#"
                    UPDATE package
                    SET version = ?, repo = ?, status = 'queued', job_id = NULL,
                        retry_count = 0, last_update = ?
                    WHERE id = ?
                    RETURNING {PACKAGE_COLUMNS}
                    "#
                ))
                .bind(version)
                .bind(repo)
                .bind(Utc::now())
                .bind(old.id)
                .fetch_one(&mut *tx)
                .await?;
                (
                    row,
                    UpsertChange::VersionChanged {
                        old_version: old.version,
                    },
                )
            }
            Some(old) => {
                let row = sqlx::query_as::<_, PackageRow>(&format!(
                    "UPDATE package SET repo = ? WHERE id = ? RETURNING {PACKAGE_COLUMNS}"
                ))
                .bind(repo)
                .bind(old.id)
                .fetch_one(&mut *tx)
                .await?;
                (row, UpsertChange::Unchanged)
            }
        };

        tx.commit().await?;

        Ok(Upserted {
            package: row.try_into()?,
            change,
        })
    }

    async fn set_status(
        &self,
        id: i64,
        status: PackageStatus,
        job_id: Option<&JobId>,
    ) -> DbResult<Package> {
        let row = sqlx::query_as::<_, PackageRow>(&format!(
            r#"
            UPDATE package
            SET status = ?, job_id = COALESCE(?, job_id), last_update = ?
            WHERE id = ?
            RETURNING {PACKAGE_COLUMNS}
            "#
        ))
        .bind(status.as_str())
        .bind(job_id.map(JobId::as_str))
        .bind(Utc::now())
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("package {}", id)))?;

        row.try_into()
    }

    async fn clear_job_id(&self, id: i64) -> DbResult<()> {
        sqlx::query("UPDATE package SET job_id = NULL WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn increment_retry_count(&self, id: i64) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "UPDATE package SET retry_count = retry_count + 1 WHERE id = ? RETURNING retry_count",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| DbError::NotFound(format!("package {}", id)))?;
        Ok(count)
    }

    async fn delete(&self, id: i64) -> DbResult<()> {
        sqlx::query("DELETE FROM package WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn packages_by_status(&self) -> DbResult<BTreeMap<PackageStatus, Vec<Package>>> {
        let mut ret: BTreeMap<PackageStatus, Vec<Package>> = PackageStatus::ALL
            .iter()
            .map(|s| (*s, Vec::new()))
            .collect();

        let packages = self
            .fetch_all(format!("SELECT {PACKAGE_COLUMNS} FROM package ORDER BY id"), &[])
            .await?;
        for package in packages {
            ret.entry(package.status).or_default().push(package);
        }
        Ok(ret)
    }

    async fn list(&self, arch: &str, branch: &str) -> DbResult<Vec<Package>> {
        self.fetch_all(
            format!("SELECT {PACKAGE_COLUMNS} FROM package WHERE arch = ? AND branch = ? ORDER BY id"),
            &[arch, branch],
        )
        .await
    }

    async fn list_with_status(&self, status: PackageStatus) -> DbResult<Vec<Package>> {
        self.fetch_all(
            format!("SELECT {PACKAGE_COLUMNS} FROM package WHERE status = ? ORDER BY id"),
            &[status.as_str()],
        )
        .await
    }

    async fn branches(&self) -> DbResult<Vec<String>> {
        let branches = sqlx::query_scalar("SELECT DISTINCT branch FROM package ORDER BY branch")
            .fetch_all(&self.pool)
            .await?;
        Ok(branches)
    }

    async fn failed_count(&self, exclude_branches: &[String]) -> DbResult<i64> {
        let mut query: QueryBuilder<Sqlite> =
            QueryBuilder::new("SELECT COUNT(*) FROM package WHERE status = 'failed'");

        if !exclude_branches.is_empty() {
            query.push(" AND branch NOT IN (");
            let mut separated = query.separated(", ");
            for branch in exclude_branches {
                separated.push_bind(branch.as_str());
            }
            separated.push_unseparated(")");
        }

        let count: i64 = query.build_query_scalar().fetch_one(&self.pool).await?;
        Ok(count)
    }

    async fn set_depends(&self, id: i64, dependency_ids: &[i64]) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let current: Vec<i64> =
            sqlx::query_scalar("SELECT dependency_id FROM package_dependency WHERE package_id = ?")
                .bind(id)
                .fetch_all(&mut *tx)
                .await?;

        let current: BTreeSet<i64> = current.into_iter().collect();
        let wanted: BTreeSet<i64> = dependency_ids.iter().copied().collect();
        if current == wanted {
            return Ok(false);
        }

        sqlx::query("DELETE FROM package_dependency WHERE package_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        for dependency_id in &wanted {
            sqlx::query("INSERT INTO package_dependency (package_id, dependency_id) VALUES (?, ?)")
                .bind(id)
                .bind(dependency_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(true)
    }

    async fn depends(&self, id: i64) -> DbResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT p.id, p.date, p.last_update, p.arch, p.branch, p.pkgname, p.version,
                   p.repo, p.status, p.job_id, p.retry_count
            FROM package p
            JOIN package_dependency d ON d.dependency_id = p.id
            WHERE d.package_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Package::try_from).collect()
    }

    async fn required_by(&self, id: i64) -> DbResult<Vec<Package>> {
        let rows = sqlx::query_as::<_, PackageRow>(
            r#"
            SELECT p.id, p.date, p.last_update, p.arch, p.branch, p.pkgname, p.version,
                   p.repo, p.status, p.job_id, p.retry_count
            FROM package p
            JOIN package_dependency d ON d.package_id = p.id
            WHERE d.dependency_id = ?
            ORDER BY p.id
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Package::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};

    async fn repo() -> (SqlitePool, SqlitePackageRepo) {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        (pool.clone(), SqlitePackageRepo::new(pool))
    }

    async fn insert(repo: &SqlitePackageRepo, pkgname: &str, version: &str) -> Package {
        repo.insert("x86_64", "master", pkgname, version, Some("main"), PackageStatus::Queued)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let (_, repo) = repo().await;
        let package = insert(&repo, "hello-world", "1-r4").await;

        assert_eq!(package.status, PackageStatus::Queued);
        assert_eq!(package.retry_count, 0);
        assert!(package.job_id.is_none());

        let found = repo.get("hello-world", "x86_64", "master").await.unwrap().unwrap();
        assert_eq!(found.id, package.id);
        assert!(repo.get("hello-world", "aarch64", "master").await.unwrap().is_none());
        assert!(matches!(repo.get_by_id(9999).await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_duplicate_triple_conflicts() {
        let (_, repo) = repo().await;
        insert(&repo, "hello-world", "1-r4").await;

        let err = repo
            .insert("x86_64", "master", "hello-world", "1-r5", None, PackageStatus::Queued)
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_upsert_version_change_requeues() {
        let (_, repo) = repo().await;
        let package = repo
            .upsert("x86_64", "master", "hello-world", "0-r0", None, PackageStatus::Queued)
            .await
            .unwrap();
        assert_eq!(package.change, UpsertChange::Inserted);

        let id = package.package.id;
        repo.set_status(id, PackageStatus::Failed, Some(&JobId::from("7")))
            .await
            .unwrap();
        repo.increment_retry_count(id).await.unwrap();

        let upserted = repo
            .upsert("x86_64", "master", "hello-world", "1-r4", Some("main"), PackageStatus::Queued)
            .await
            .unwrap();
        assert_eq!(
            upserted.change,
            UpsertChange::VersionChanged {
                old_version: "0-r0".to_string()
            }
        );
        assert_eq!(upserted.package.id, id);
        assert_eq!(upserted.package.version, "1-r4");
        assert_eq!(upserted.package.status, PackageStatus::Queued);
        assert_eq!(upserted.package.retry_count, 0);
        assert!(upserted.package.job_id.is_none());
    }

    #[tokio::test]
    async fn test_upsert_same_version_keeps_status() {
        let (_, repo) = repo().await;
        let package = insert(&repo, "hello-world", "1-r4").await;
        repo.set_status(package.id, PackageStatus::Published, None)
            .await
            .unwrap();

        let upserted = repo
            .upsert("x86_64", "master", "hello-world", "1-r4", Some("community"), PackageStatus::Queued)
            .await
            .unwrap();
        assert_eq!(upserted.change, UpsertChange::Unchanged);
        assert_eq!(upserted.package.status, PackageStatus::Published);
        assert_eq!(upserted.package.repo.as_deref(), Some("community"));
    }

    #[tokio::test]
    async fn test_set_status_keeps_job_id_unless_given() {
        let (_, repo) = repo().await;
        let package = insert(&repo, "hello-world", "1-r4").await;

        let building = repo
            .set_status(package.id, PackageStatus::Building, Some(&JobId::from("42")))
            .await
            .unwrap();
        assert_eq!(building.job_id, Some(JobId::from("42")));
        assert!(building.last_update.is_some());

        let built = repo
            .set_status(package.id, PackageStatus::Built, None)
            .await
            .unwrap();
        assert_eq!(built.job_id, Some(JobId::from("42")));

        let by_job = repo.get_by_job_id(&JobId::from("42")).await.unwrap().unwrap();
        assert_eq!(by_job.id, package.id);

        repo.clear_job_id(package.id).await.unwrap();
        assert!(repo.get_by_job_id(&JobId::from("42")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dependency_edges_both_directions() {
        let (_, repo) = repo().await;
        let lib = insert(&repo, "hello-world", "1-r4").await;
        let app = insert(&repo, "hello-world-wrapper", "1-r2").await;

        assert!(repo.set_depends(app.id, &[lib.id]).await.unwrap());
        assert!(!repo.set_depends(app.id, &[lib.id]).await.unwrap());

        let depends = repo.depends(app.id).await.unwrap();
        assert_eq!(depends.len(), 1);
        assert_eq!(depends[0].pkgname, "hello-world");

        let required_by = repo.required_by(lib.id).await.unwrap();
        assert_eq!(required_by.len(), 1);
        assert_eq!(required_by[0].pkgname, "hello-world-wrapper");

        assert!(repo.set_depends(app.id, &[]).await.unwrap());
        assert!(repo.depends(app.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_edges() {
        let (pool, repo) = repo().await;
        let lib = insert(&repo, "hello-world", "1-r4").await;
        let app = insert(&repo, "hello-world-wrapper", "1-r2").await;
        repo.set_depends(app.id, &[lib.id]).await.unwrap();

        repo.delete(lib.id).await.unwrap();
        assert!(repo.depends(app.id).await.unwrap().is_empty());

        let edges: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM package_dependency")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(edges, 0);
    }

    #[tokio::test]
    async fn test_packages_by_status_has_every_key() {
        let (_, repo) = repo().await;
        let package = insert(&repo, "hello-world", "1-r4").await;
        repo.set_status(package.id, PackageStatus::Built, None)
            .await
            .unwrap();

        let by_status = repo.packages_by_status().await.unwrap();
        assert_eq!(by_status.len(), PackageStatus::ALL.len());
        assert_eq!(by_status[&PackageStatus::Built].len(), 1);
        assert!(by_status[&PackageStatus::Queued].is_empty());
    }

    #[tokio::test]
    async fn test_failed_count_excludes_branches() {
        let (_, repo) = repo().await;
        for branch in ["master", "v20.05"] {
            let package = repo
                .insert("x86_64", branch, "hello-world", "1-r4", None, PackageStatus::Queued)
                .await
                .unwrap();
            repo.set_status(package.id, PackageStatus::Failed, None)
                .await
                .unwrap();
        }

        assert_eq!(repo.failed_count(&[]).await.unwrap(), 2);
        assert_eq!(repo.failed_count(&["v20.05".to_string()]).await.unwrap(), 1);
        assert_eq!(repo.branches().await.unwrap(), vec!["master", "v20.05"]);
    }

    #[tokio::test]
    async fn test_invalid_status_is_reported() {
        let (pool, repo) = repo().await;
        let package = insert(&repo, "hello-world", "1-r4").await;
        sqlx::query("UPDATE package SET status = 'exploded' WHERE id = ?")
            .bind(package.id)
            .execute(&pool)
            .await
            .unwrap();

        assert!(matches!(
            repo.get_by_id(package.id).await,
            Err(DbError::InvalidData(_))
        ));
    }
}
