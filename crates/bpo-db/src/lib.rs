//! State store for the bpo build coordinator.
//!
//! Provides repository traits and SQLite implementations.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::str::FromStr;
use std::sync::Arc;

/// Create a new database connection pool.
///
/// `database` is a file path or `:memory:`. In-memory databases get a
/// single connection that is never recycled, so every query sees the same
/// database.
pub async fn create_pool(database: &str) -> DbResult<SqlitePool> {
    let pool = if database == ":memory:" {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        let options = SqliteConnectOptions::new()
            .filename(database)
            .create_if_missing(true)
            .foreign_keys(true);
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Handles to every repository, sharing one pool.
#[derive(Clone)]
pub struct Store {
    pub packages: Arc<dyn PackageRepo>,
    pub images: Arc<dyn ImageRepo>,
    pub logs: Arc<dyn LogRepo>,
    pub pushes: Arc<dyn PushRepo>,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            packages: Arc::new(SqlitePackageRepo::new(pool.clone())),
            images: Arc::new(SqliteImageRepo::new(pool.clone())),
            logs: Arc::new(SqliteLogRepo::new(pool.clone())),
            pushes: Arc::new(SqlitePushRepo::new(pool)),
        }
    }

    /// Open a database, apply migrations and return the store.
    pub async fn open(database: &str) -> DbResult<Self> {
        let pool = create_pool(database).await?;
        run_migrations(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Fresh in-memory store with the schema applied.
    pub async fn in_memory() -> DbResult<Self> {
        Self::open(":memory:").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_database_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bpo.db");

        let store = Store::open(path.to_str().unwrap()).await.unwrap();
        assert!(path.exists());
        assert!(store.logs.recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_migrations_are_idempotent() {
        let pool = create_pool(":memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        run_migrations(&pool).await.unwrap();
    }
}
