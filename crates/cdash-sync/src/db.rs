//! SQLite store, get-or-insert helpers and batched transactions.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cdash_core::RepoRef;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool,
    SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle on the dashboard database file.
#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if needed) the database and applies pending migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        // The file is compressed and shipped as a single artifact, so keep the
        // rollback journal instead of WAL side files.
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One writer, and every sync step runs in sequence.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn batch(&self, batch_size: usize) -> BatchWriter {
        BatchWriter::new(self.pool.clone(), batch_size)
    }

    /// True when a full update finished less than `window` before `now`.
    pub async fn recently_updated(&self, now: DateTime<Utc>, window: chrono::Duration) -> StoreResult<bool> {
        let last: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT datetime FROM update_db_info WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(last.is_some_and(|last| now - last < window))
    }

    pub async fn mark_updated(&self, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO update_db_info (id, datetime) VALUES (1, ?)
            ON CONFLICT(id) DO UPDATE SET datetime = excluded.datetime
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flushes and closes every connection so the file can be copied.
    pub async fn close(self) {
        self.pool.close().await;
    }
}

pub type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// A row identified by a natural key that is created on first sight and
/// never updated afterwards.
pub trait EnsureExists {
    /// `INSERT ... ON CONFLICT DO NOTHING` statement taking the key columns.
    const INSERT_SQL: &'static str;

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q>;
}

/// Get-or-insert by natural key. Returns `true` when a row was created.
pub async fn ensure<E: EnsureExists>(conn: &mut SqliteConnection, entity: &E) -> StoreResult<bool> {
    let result = entity
        .bind_key(sqlx::query(E::INSERT_SQL))
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

pub struct GithubUser<'a>(pub &'a str);

impl EnsureExists for GithubUser<'_> {
    const INSERT_SQL: &'static str = "INSERT INTO github_users (username) VALUES (?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0)
    }
}

pub struct Label<'a>(pub &'a str);

impl EnsureExists for Label<'_> {
    const INSERT_SQL: &'static str = "INSERT INTO github_labels (label) VALUES (?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0)
    }
}

/// Requires the owner to exist in `github_users`.
pub struct Repository<'a>(pub &'a RepoRef);

impl EnsureExists for Repository<'_> {
    const INSERT_SQL: &'static str =
        "INSERT INTO github_repositories (user, name) VALUES (?, ?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0.owner.as_str()).bind(self.0.name.as_str())
    }
}

pub struct Release<'a> {
    pub repo: &'a RepoRef,
    pub tag: &'a str,
}

impl EnsureExists for Release<'_> {
    const INSERT_SQL: &'static str = r#"
        INSERT INTO github_releases (repository_user, repository_name, release_tag)
        VALUES (?, ?, ?) ON CONFLICT DO NOTHING
    "#;

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query
            .bind(self.repo.owner.as_str())
            .bind(self.repo.name.as_str())
            .bind(self.tag)
    }
}

pub struct OperatingSystem<'a>(pub &'a str);

impl EnsureExists for OperatingSystem<'_> {
    const INSERT_SQL: &'static str = "INSERT INTO pypi_operating_systems (name) VALUES (?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0)
    }
}

pub struct PythonVersion<'a>(pub &'a str);

impl EnsureExists for PythonVersion<'_> {
    const INSERT_SQL: &'static str = "INSERT INTO pypi_python_versions (version) VALUES (?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0)
    }
}

pub struct ForumTag<'a>(pub &'a str);

impl EnsureExists for ForumTag<'_> {
    const INSERT_SQL: &'static str = "INSERT INTO forum_tags (name) VALUES (?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.0)
    }
}

pub struct ForumUser<'a> {
    pub id: i64,
    pub username: &'a str,
    pub name: Option<&'a str>,
}

impl EnsureExists for ForumUser<'_> {
    const INSERT_SQL: &'static str =
        "INSERT INTO forum_users (id, username, name) VALUES (?, ?, ?) ON CONFLICT DO NOTHING";

    fn bind_key<'q>(&'q self, query: SqliteQuery<'q>) -> SqliteQuery<'q> {
        query.bind(self.id).bind(self.username).bind(self.name)
    }
}

/// Ensures the owner user and the repository rows.
pub async fn ensure_repository(conn: &mut SqliteConnection, repo: &RepoRef) -> StoreResult<()> {
    ensure(conn, &GithubUser(&repo.owner)).await?;
    ensure(conn, &Repository(repo)).await?;
    Ok(())
}

/// Groups writes into transactions of roughly `batch_size` records.
///
/// Dropping the writer with an open transaction rolls the pending batch back,
/// which leaves the already committed batches in place.
pub struct BatchWriter {
    pool: SqlitePool,
    tx: Option<Transaction<'static, Sqlite>>,
    batch_size: usize,
    pending: usize,
    committed: usize,
}

impl BatchWriter {
    pub fn new(pool: SqlitePool, batch_size: usize) -> Self {
        Self {
            pool,
            tx: None,
            batch_size: batch_size.max(1),
            pending: 0,
            committed: 0,
        }
    }

    /// Connection inside the current transaction, opening one if needed.
    pub async fn conn(&mut self) -> StoreResult<&mut SqliteConnection> {
        let tx = match self.tx.take() {
            Some(tx) => tx,
            None => self.pool.begin().await?,
        };
        Ok(&mut **self.tx.insert(tx))
    }

    /// Counts `records` written and commits once the batch is full.
    pub async fn record(&mut self, records: usize) -> StoreResult<()> {
        self.pending += records;
        if self.pending >= self.batch_size {
            self.commit().await?;
        }
        Ok(())
    }

    pub async fn commit(&mut self) -> StoreResult<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await?;
            debug!(records = self.pending, "committed batch");
            self.committed += self.pending;
            self.pending = 0;
        }
        Ok(())
    }

    /// Commits the last batch and returns the number of records written.
    pub async fn finish(mut self) -> StoreResult<usize> {
        self.commit().await?;
        Ok(self.committed)
    }
}
