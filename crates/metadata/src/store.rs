//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::repos::{FileRepo, UploadRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: UploadRepo + FileRepo + Send + Sync {
    /// Create or upgrade the schema.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check store connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (creating if needed) a SQLite database file.
    ///
    /// `busy_timeout_secs` bounds how long a statement waits on a locked database.
    pub async fn new(path: impl AsRef<Path>, busy_timeout_secs: Option<u64>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(busy_timeout_secs.unwrap_or(5)));

        Self::connect(opts).await
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> MetadataResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        Self::connect(opts).await
    }

    async fn connect(opts: SqliteConnectOptions) -> MetadataResult<Self> {
        let pool = SqlitePoolOptions::new()
            // A single connection serializes writers, which makes every
            // transaction below trivially isolated and avoids "database is locked".
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

// Implement the repository traits for SqliteStore
mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use crate::repos::files::{check_update, status_mismatch};
    use crate::repos::{FileVisitor, UploadVisitor};
    use futures::TryStreamExt;
    use parcel_core::paging::Seek;
    use parcel_core::timestamp::to_micros;
    use parcel_core::{
        Cursor, File, FileId, FileStatus, Page, PagingQuery, Upload, UploadFilter, UploadId,
    };
    use sqlx::{Executor, QueryBuilder};
    use time::OffsetDateTime;

    async fn insert_upload<'e, E>(exec: E, row: &UploadRow) -> MetadataResult<()>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        sqlx::query(
            r#"
            INSERT INTO uploads (
                id, upload_token, user_id, token, comments,
                one_shot, removable, stream, protected_by_password,
                login, password_hash, ttl, created_at, expire_at, deleted_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&row.id)
        .bind(&row.upload_token)
        .bind(&row.user_id)
        .bind(&row.token)
        .bind(&row.comments)
        .bind(row.one_shot)
        .bind(row.removable)
        .bind(row.stream)
        .bind(row.protected_by_password)
        .bind(&row.login)
        .bind(&row.password_hash)
        .bind(row.ttl)
        .bind(row.created_at)
        .bind(row.expire_at)
        .bind(row.deleted_at)
        .execute(exec)
        .await?;
        Ok(())
    }

    /// Insert a file only if its upload is alive. Returns the number of rows written.
    async fn insert_file<'e, E>(exec: E, row: &FileRow) -> MetadataResult<u64>
    where
        E: Executor<'e, Database = Sqlite>,
    {
        let result = sqlx::query(
            r#"
            INSERT INTO files (
                id, upload_id, name, status, mime_type, size, md5,
                reference, backend_details, created_at
            )
            SELECT ?, ?, ?, ?, ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM uploads WHERE id = ? AND deleted_at IS NULL)
            "#,
        )
        .bind(&row.id)
        .bind(&row.upload_id)
        .bind(&row.name)
        .bind(&row.status)
        .bind(&row.mime_type)
        .bind(row.size)
        .bind(&row.md5)
        .bind(&row.reference)
        .bind(&row.backend_details)
        .bind(row.created_at)
        .bind(&row.upload_id)
        .execute(exec)
        .await?;
        Ok(result.rows_affected())
    }

    #[async_trait]
    impl UploadRepo for SqliteStore {
        async fn create_upload(&self, upload: &Upload, files: &[File]) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            insert_upload(&mut *tx, &UploadRow::from(upload)).await?;
            for file in files {
                if file.upload_id != upload.id {
                    return Err(MetadataError::Internal(format!(
                        "file {} belongs to upload {}, not {}",
                        file.id, file.upload_id, upload.id
                    )));
                }
                insert_file(&mut *tx, &FileRow::try_from(file)?).await?;
            }
            tx.commit().await?;
            Ok(())
        }

        async fn get_upload(&self, id: &UploadId) -> MetadataResult<Option<Upload>> {
            let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
            Ok(row.map(Upload::from))
        }

        async fn list_uploads(
            &self,
            filter: &UploadFilter,
            paging: &PagingQuery,
        ) -> MetadataResult<Page<Upload>> {
            let window = paging.window()?;

            let mut qb = QueryBuilder::<Sqlite>::new("SELECT * FROM uploads WHERE 1 = 1");
            if !filter.include_deleted {
                qb.push(" AND deleted_at IS NULL");
            }
            if let Some(user) = &filter.user {
                qb.push(" AND user_id = ").push_bind(user.clone());
            }
            if let Some(token) = &filter.token {
                qb.push(" AND token = ").push_bind(token.clone());
            }
            if let Some((cursor, seek)) = &window.seek {
                let op = match seek {
                    Seek::Below => "<",
                    Seek::Above => ">",
                };
                qb.push(format!(" AND (created_at {op} "))
                    .push_bind(cursor.created_at)
                    .push(" OR (created_at = ")
                    .push_bind(cursor.created_at)
                    .push(format!(" AND id {op} "))
                    .push_bind(cursor.id.clone())
                    .push("))");
            }
            let dir = if window.descending { "DESC" } else { "ASC" };
            qb.push(format!(" ORDER BY created_at {dir}, id {dir} LIMIT "))
                .push_bind(window.fetch_limit() as i64);

            let rows: Vec<UploadRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            let uploads = rows.into_iter().map(Upload::from).collect();
            Ok(window.finish(uploads, |u: &Upload| {
                Cursor::new(u.created_at, u.id.as_str())
            }))
        }

        async fn for_each_upload(&self, visit: &mut UploadVisitor<'_>) -> MetadataResult<()> {
            let mut rows =
                sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads ORDER BY created_at, id")
                    .fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                visit(&Upload::from(row))?;
            }
            Ok(())
        }

        async fn get_expired_uploads(
            &self,
            now: OffsetDateTime,
            after: Option<&UploadId>,
            limit: u32,
        ) -> MetadataResult<Vec<Upload>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                r#"
                SELECT * FROM uploads
                WHERE deleted_at IS NULL AND expire_at IS NOT NULL AND expire_at <= ? AND id > ?
                ORDER BY id
                LIMIT ?
                "#,
            )
            .bind(to_micros(now))
            .bind(after.map(|id| id.as_str()).unwrap_or(""))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(Upload::from).collect())
        }

        async fn get_deleted_uploads(
            &self,
            after: Option<&UploadId>,
            limit: u32,
        ) -> MetadataResult<Vec<Upload>> {
            let rows = sqlx::query_as::<_, UploadRow>(
                "SELECT * FROM uploads WHERE deleted_at IS NOT NULL AND id > ? ORDER BY id LIMIT ?",
            )
            .bind(after.map(|id| id.as_str()).unwrap_or(""))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            Ok(rows.into_iter().map(Upload::from).collect())
        }

        async fn soft_delete_upload(
            &self,
            id: &UploadId,
            now: OffsetDateTime,
        ) -> MetadataResult<bool> {
            let result =
                sqlx::query("UPDATE uploads SET deleted_at = ? WHERE id = ? AND deleted_at IS NULL")
                    .bind(to_micros(now))
                    .bind(id.as_str())
                    .execute(&self.pool)
                    .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn set_upload_expiration(
            &self,
            id: &UploadId,
            ttl: i64,
            expire_at: Option<OffsetDateTime>,
        ) -> MetadataResult<bool> {
            let result = sqlx::query(
                "UPDATE uploads SET ttl = ?, expire_at = ? WHERE id = ? AND deleted_at IS NULL",
            )
            .bind(ttl)
            .bind(expire_at.map(to_micros))
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        }

        async fn purge_upload(&self, id: &UploadId) -> MetadataResult<PurgeOutcome> {
            let mut tx = self.pool.begin().await?;

            let upload = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
            match upload {
                None => return Ok(PurgeOutcome::NotFound),
                Some(row) if row.deleted_at.is_none() => return Ok(PurgeOutcome::Alive),
                Some(_) => {}
            }

            let pending = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE upload_id = ? AND status <> 'deleted' ORDER BY created_at, id",
            )
            .bind(id.as_str())
            .fetch_all(&mut *tx)
            .await?;
            if !pending.is_empty() {
                return Ok(PurgeOutcome::Pending(files_from_rows(pending)?));
            }

            sqlx::query("DELETE FROM files WHERE upload_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM uploads WHERE id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(PurgeOutcome::Purged)
        }
    }

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn create_file(&self, file: &File) -> MetadataResult<()> {
            let written = insert_file(&self.pool, &FileRow::try_from(file)?).await?;
            if written == 0 {
                return Err(MetadataError::NotFound(format!("upload {}", file.upload_id)));
            }
            Ok(())
        }

        async fn get_file(&self, id: &FileId) -> MetadataResult<Option<File>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = ?")
                .bind(id.as_str())
                .fetch_optional(&self.pool)
                .await?;
            row.map(File::try_from).transpose()
        }

        async fn get_files(&self, upload_id: &UploadId) -> MetadataResult<Vec<File>> {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE upload_id = ? ORDER BY created_at, id",
            )
            .bind(upload_id.as_str())
            .fetch_all(&self.pool)
            .await?;
            files_from_rows(rows)
        }

        async fn update_file_status(
            &self,
            id: &FileId,
            expected: FileStatus,
            new: FileStatus,
        ) -> MetadataResult<File> {
            expected.check_transition(new)?;

            let row = sqlx::query_as::<_, FileRow>(
                "UPDATE files SET status = ? WHERE id = ? AND status = ? RETURNING *",
            )
            .bind(new.as_str())
            .bind(id.as_str())
            .bind(expected.as_str())
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => File::try_from(row),
                None => Err(status_mismatch(self, id, expected).await),
            }
        }

        async fn update_file(&self, file: &File, expected: FileStatus) -> MetadataResult<()> {
            check_update(expected, file.status)?;
            let row = FileRow::try_from(file)?;

            let result = sqlx::query(
                r#"
                UPDATE files
                SET name = ?, status = ?, mime_type = ?, size = ?, md5 = ?,
                    reference = ?, backend_details = ?
                WHERE id = ? AND status = ?
                "#,
            )
            .bind(&row.name)
            .bind(&row.status)
            .bind(&row.mime_type)
            .bind(row.size)
            .bind(&row.md5)
            .bind(&row.reference)
            .bind(&row.backend_details)
            .bind(&row.id)
            .bind(expected.as_str())
            .execute(&self.pool)
            .await?;

            if result.rows_affected() == 0 {
                return Err(status_mismatch(self, &file.id, expected).await);
            }
            Ok(())
        }

        async fn get_files_by_status(
            &self,
            status: FileStatus,
            after: Option<&FileId>,
            limit: u32,
        ) -> MetadataResult<Vec<File>> {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE status = ? AND id > ? ORDER BY id LIMIT ?",
            )
            .bind(status.as_str())
            .bind(after.map(|id| id.as_str()).unwrap_or(""))
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
            files_from_rows(rows)
        }

        async fn count_upload_files(&self, upload_id: &UploadId) -> MetadataResult<u64> {
            let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE upload_id = ?")
                .bind(upload_id.as_str())
                .fetch_one(&self.pool)
                .await?;
            Ok(count as u64)
        }

        async fn for_each_file(&self, visit: &mut FileVisitor<'_>) -> MetadataResult<()> {
            let mut rows = sqlx::query_as::<_, FileRow>("SELECT * FROM files ORDER BY id")
                .fetch(&self.pool);
            while let Some(row) = rows.try_next().await? {
                visit(&File::try_from(row)?)?;
            }
            Ok(())
        }

        async fn statistics(&self) -> MetadataResult<Statistics> {
            let (uploads, anonymous_uploads): (i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    CAST(COALESCE(SUM(CASE WHEN user_id IS NULL THEN 1 ELSE 0 END), 0) AS BIGINT)
                FROM uploads
                WHERE deleted_at IS NULL
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

            let (files, total_size, anonymous_size): (i64, i64, i64) = sqlx::query_as(
                r#"
                SELECT
                    COUNT(*),
                    CAST(COALESCE(SUM(COALESCE(f.size, 0)), 0) AS BIGINT),
                    CAST(COALESCE(SUM(CASE WHEN u.user_id IS NULL THEN COALESCE(f.size, 0) ELSE 0 END), 0) AS BIGINT)
                FROM files f
                JOIN uploads u ON u.id = f.upload_id
                WHERE u.deleted_at IS NULL AND f.status <> 'deleted'
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

            Ok(Statistics {
                uploads: uploads as u64,
                anonymous_uploads: anonymous_uploads as u64,
                files: files as u64,
                total_size: total_size as u64,
                anonymous_size: anonymous_size as u64,
            })
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS uploads (
    id TEXT PRIMARY KEY,
    upload_token TEXT,
    user_id TEXT,
    token TEXT,
    comments TEXT,
    one_shot INTEGER NOT NULL DEFAULT 0,
    removable INTEGER NOT NULL DEFAULT 0,
    stream INTEGER NOT NULL DEFAULT 0,
    protected_by_password INTEGER NOT NULL DEFAULT 0,
    login TEXT,
    password_hash TEXT,
    ttl INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    expire_at INTEGER,
    deleted_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_uploads_created ON uploads(created_at, id);
CREATE INDEX IF NOT EXISTS idx_uploads_expire ON uploads(expire_at) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_uploads_deleted ON uploads(deleted_at);
CREATE INDEX IF NOT EXISTS idx_uploads_user ON uploads(user_id, created_at);

CREATE TABLE IF NOT EXISTS files (
    id TEXT PRIMARY KEY,
    upload_id TEXT NOT NULL REFERENCES uploads(id),
    name TEXT NOT NULL,
    status TEXT NOT NULL,
    mime_type TEXT,
    size INTEGER,
    md5 TEXT,
    reference TEXT,
    backend_details TEXT,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_files_upload ON files(upload_id);
CREATE INDEX IF NOT EXISTS idx_files_status ON files(status, id);
"#;
