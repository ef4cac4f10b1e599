//! Metadata store for file records, backed by SQLite.

use crate::models::file_record::{FileRecord, NewFileRecord};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use std::{str::FromStr, sync::Arc};
use thiserror::Error;
use tracing::{debug, info};

const INIT_SQL: &str = include_str!("../../migrations/0001_init.sql");

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("identifier `{0}` already exists")]
    DuplicateIdentifier(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Insert and lookup of file records.
///
/// Records are written once and never updated.
#[async_trait]
pub trait FileRepository: Send + Sync {
    async fn insert(&self, record: NewFileRecord) -> RepositoryResult<FileRecord>;

    async fn find_by_identifier(&self, identifier: &str) -> RepositoryResult<Option<FileRecord>>;

    /// Cheap round-trip used by the readiness probe.
    async fn ping(&self) -> RepositoryResult<()>;
}

#[derive(Clone)]
pub struct SqliteFileRepository {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl SqliteFileRepository {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl FileRepository for SqliteFileRepository {
    async fn insert(&self, record: NewFileRecord) -> RepositoryResult<FileRecord> {
        let result = sqlx::query_as::<_, FileRecord>(
            r#"
            INSERT INTO file_records (
                identifier, bucket, relative_path, file_name, extension, created_at
            ) VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, identifier, bucket, relative_path, file_name, extension, created_at
            "#,
        )
        .bind(&record.identifier)
        .bind(&record.bucket)
        .bind(&record.relative_path)
        .bind(&record.file_name)
        .bind(&record.extension)
        .bind(Utc::now())
        .fetch_one(&*self.db)
        .await;

        match result {
            Ok(inserted) => {
                debug!(identifier = %inserted.identifier, id = inserted.id, "inserted file record");
                Ok(inserted)
            }
            Err(err) if is_unique_violation(&err) => {
                Err(RepositoryError::DuplicateIdentifier(record.identifier))
            }
            Err(err) => Err(RepositoryError::Sqlx(err)),
        }
    }

    async fn find_by_identifier(&self, identifier: &str) -> RepositoryResult<Option<FileRecord>> {
        let record = sqlx::query_as::<_, FileRecord>(
            "SELECT id, identifier, bucket, relative_path, file_name, extension, created_at
             FROM file_records WHERE identifier = ?",
        )
        .bind(identifier)
        .fetch_optional(&*self.db)
        .await?;

        Ok(record)
    }

    async fn ping(&self) -> RepositoryResult<()> {
        sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        Ok(())
    }
}

/// Open the SQLite pool, creating the database file if missing.
pub async fn connect(database_url: &str, max_connections: u32) -> RepositoryResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply the embedded schema. Every statement is idempotent.
pub async fn run_migrations(db: &SqlitePool) -> RepositoryResult<()> {
    let statements = INIT_SQL
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>();

    info!("Running {} migration statements...", statements.len());

    for stmt in statements {
        debug!("Executing migration SQL: {}", stmt);
        sqlx::query(stmt).execute(db).await?;
    }

    Ok(())
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
