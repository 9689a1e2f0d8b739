//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::files::{check_update, status_mismatch};
use crate::repos::{FileRepo, FileVisitor, UploadRepo, UploadVisitor};
use crate::store::MetadataStore;
use async_trait::async_trait;
use futures::TryStreamExt;
use parcel_core::config::PgSslMode;
use parcel_core::paging::Seek;
use parcel_core::timestamp::to_micros;
use parcel_core::{Cursor, File, FileId, FileStatus, Page, PagingQuery, Upload, UploadFilter, UploadId};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode as SqlxPgSslMode};
use sqlx::{Executor, Pool, Postgres, QueryBuilder};
use std::str::FromStr;
use time::OffsetDateTime;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store from a connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Create a new PostgreSQL store from individual connection parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        ssl_mode: Option<PgSslMode>,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);

        if let Some(user) = username {
            opts = opts.username(user);
        }

        if let Some(pass) = password {
            opts = opts.password(pass);
        }

        if let Some(mode) = ssl_mode {
            let sqlx_mode = match mode {
                PgSslMode::Disable => SqlxPgSslMode::Disable,
                PgSslMode::Prefer => SqlxPgSslMode::Prefer,
                PgSslMode::Require => SqlxPgSslMode::Require,
            };
            opts = opts.ssl_mode(sqlx_mode);
        }

        // Log connection info without password
        tracing::info!(
            host = host,
            port = port,
            database = database,
            username = username.unwrap_or("<none>"),
            ssl_mode = ?ssl_mode,
            "Connecting to PostgreSQL with individual parameters"
        );

        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", format!("{}ms", timeout_ms))]);
            tracing::info!("PostgreSQL statement_timeout set to {}ms", timeout_ms);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;

        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // Prepared statements hold one statement each.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

async fn insert_upload<'e, E>(exec: E, row: &UploadRow) -> MetadataResult<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO uploads (
            id, upload_token, user_id, token, comments,
            one_shot, removable, stream, protected_by_password,
            login, password_hash, ttl, created_at, expire_at, deleted_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
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
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO files (
            id, upload_id, name, status, mime_type, size, md5,
            reference, backend_details, created_at
        )
        SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10
        WHERE EXISTS (SELECT 1 FROM uploads WHERE id = $2 AND deleted_at IS NULL)
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
    .execute(exec)
    .await?;
    Ok(result.rows_affected())
}

#[async_trait]
impl UploadRepo for PostgresStore {
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
        let row = sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = $1")
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

        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM uploads WHERE TRUE");
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
            qb.push(format!(" AND (created_at, id) {op} ("))
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.id.clone())
                .push(")");
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
            WHERE deleted_at IS NULL AND expire_at IS NOT NULL AND expire_at <= $1 AND id > $2
            ORDER BY id
            LIMIT $3
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
            "SELECT * FROM uploads WHERE deleted_at IS NOT NULL AND id > $1 ORDER BY id LIMIT $2",
        )
        .bind(after.map(|id| id.as_str()).unwrap_or(""))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Upload::from).collect())
    }

    async fn soft_delete_upload(&self, id: &UploadId, now: OffsetDateTime) -> MetadataResult<bool> {
        let result =
            sqlx::query("UPDATE uploads SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL")
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
            "UPDATE uploads SET ttl = $1, expire_at = $2 WHERE id = $3 AND deleted_at IS NULL",
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

        // Row lock keeps concurrent purges of the same upload serialized.
        let upload =
            sqlx::query_as::<_, UploadRow>("SELECT * FROM uploads WHERE id = $1 FOR UPDATE")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        match upload {
            None => return Ok(PurgeOutcome::NotFound),
            Some(row) if row.deleted_at.is_none() => return Ok(PurgeOutcome::Alive),
            Some(_) => {}
        }

        let pending = sqlx::query_as::<_, FileRow>(
            r#"
            SELECT * FROM files
            WHERE upload_id = $1 AND status <> 'deleted'
            ORDER BY created_at, id
            FOR UPDATE
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&mut *tx)
        .await?;
        if !pending.is_empty() {
            return Ok(PurgeOutcome::Pending(files_from_rows(pending)?));
        }

        sqlx::query("DELETE FROM files WHERE upload_id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM uploads WHERE id = $1")
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(PurgeOutcome::Purged)
    }
}

#[async_trait]
impl FileRepo for PostgresStore {
    async fn create_file(&self, file: &File) -> MetadataResult<()> {
        let written = insert_file(&self.pool, &FileRow::try_from(file)?).await?;
        if written == 0 {
            return Err(MetadataError::NotFound(format!("upload {}", file.upload_id)));
        }
        Ok(())
    }

    async fn get_file(&self, id: &FileId) -> MetadataResult<Option<File>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        row.map(File::try_from).transpose()
    }

    async fn get_files(&self, upload_id: &UploadId) -> MetadataResult<Vec<File>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE upload_id = $1 ORDER BY created_at, id",
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
            "UPDATE files SET status = $1 WHERE id = $2 AND status = $3 RETURNING *",
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
            SET name = $1, status = $2, mime_type = $3, size = $4, md5 = $5,
                reference = $6, backend_details = $7
            WHERE id = $8 AND status = $9
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
            "SELECT * FROM files WHERE status = $1 AND id > $2 ORDER BY id LIMIT $3",
        )
        .bind(status.as_str())
        .bind(after.map(|id| id.as_str()).unwrap_or(""))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        files_from_rows(rows)
    }

    async fn count_upload_files(&self, upload_id: &UploadId) -> MetadataResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM files WHERE upload_id = $1")
            .bind(upload_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn for_each_file(&self, visit: &mut FileVisitor<'_>) -> MetadataResult<()> {
        let mut rows =
            sqlx::query_as::<_, FileRow>("SELECT * FROM files ORDER BY id").fetch(&self.pool);
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
                COUNT(*) FILTER (WHERE user_id IS NULL)
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
                CAST(COALESCE(SUM(COALESCE(f.size, 0)) FILTER (WHERE u.user_id IS NULL), 0) AS BIGINT)
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

#[cfg(test)]
mod tests {
    use super::postgres_schema_statements;

    #[test]
    fn postgres_schema_statements_skips_empty_and_comment_only() {
        let schema = r#"
            -- comment only

            CREATE TABLE foo (id int);
            ;
            -- another comment
            CREATE TABLE bar (id int);
        "#;

        let statements = postgres_schema_statements(schema);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].contains("CREATE TABLE foo"));
        assert!(statements[1].contains("CREATE TABLE bar"));
    }

    #[test]
    fn embedded_schema_creates_both_tables() {
        let statements = postgres_schema_statements(super::POSTGRES_SCHEMA);
        assert!(statements.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS uploads")));
        assert!(statements.iter().any(|s| s.contains("CREATE TABLE IF NOT EXISTS files")));
    }
}
