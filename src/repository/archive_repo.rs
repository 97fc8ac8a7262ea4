//! Archive repository (归档记录数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::{ArchiveStore, ArchiveTransition};
use crate::{
    error::AppError,
    models::archive::{ArchiveStatus, ArchivedFile, TenantArchiveUsage},
    models::integration::Platform,
};

const ARCHIVE_COLUMNS: &str = "id, tenant_id, platform, external_id, file_name, mime_type, \
     size_bytes, content_sha256, storage_key, storage_url, status, original_location, archived_by, \
     archived_at, expires_at, last_warning_days, restored_at, restored_location, deleted_at, \
     created_at, updated_at";

pub struct PgArchiveStore {
    db: PgPool,
}

impl PgArchiveStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ArchiveStore for PgArchiveStore {
    async fn insert_archive(&self, file: &ArchivedFile) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            INSERT INTO archived_files (
                id, tenant_id, platform, external_id, file_name, mime_type, size_bytes,
                content_sha256, storage_key, storage_url, status, original_location, archived_by,
                archived_at, expires_at, last_warning_days, restored_at, restored_location,
                deleted_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            "#,
        )
        .bind(file.id)
        .bind(file.tenant_id)
        .bind(file.platform)
        .bind(&file.external_id)
        .bind(&file.file_name)
        .bind(&file.mime_type)
        .bind(file.size_bytes)
        .bind(&file.content_sha256)
        .bind(&file.storage_key)
        .bind(&file.storage_url)
        .bind(file.status)
        .bind(&file.original_location)
        .bind(file.archived_by)
        .bind(file.archived_at)
        .bind(file.expires_at)
        .bind(file.last_warning_days)
        .bind(file.restored_at)
        .bind(&file.restored_location)
        .bind(file.deleted_at)
        .bind(file.created_at)
        .bind(file.updated_at)
        .execute(&self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Err(AppError::Conflict(
                format!("{} is already archived", file.external_id),
            )),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_archive(&self, id: Uuid) -> Result<Option<ArchivedFile>, AppError> {
        let sql = format!("SELECT {} FROM archived_files WHERE id = $1", ARCHIVE_COLUMNS);
        let file = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(file)
    }

    async fn find_live_archive(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ArchivedFile>, AppError> {
        let sql = format!(
            "SELECT {} FROM archived_files WHERE tenant_id = $1 AND platform = $2 AND external_id = $3 \
             AND status IN ('staged', 'archived')",
            ARCHIVE_COLUMNS
        );
        let file = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(tenant_id)
            .bind(platform)
            .bind(external_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(file)
    }

    async fn transition_archive(
        &self,
        id: Uuid,
        from: &[ArchiveStatus],
        change: ArchiveTransition,
    ) -> Result<bool, AppError> {
        let to = change.target_status();
        let result = match change {
            ArchiveTransition::Archived {
                storage_key,
                storage_url,
                content_sha256,
                size_bytes,
                mime_type,
                archived_at,
                expires_at,
            } => {
                sqlx::query(
                    r#"
                    UPDATE archived_files
                    SET status = $3, storage_key = $4, storage_url = $5, content_sha256 = $6,
                        size_bytes = $7, mime_type = COALESCE($8, mime_type),
                        archived_at = $9, expires_at = $10, updated_at = NOW()
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(from)
                .bind(to)
                .bind(storage_key)
                .bind(storage_url)
                .bind(content_sha256)
                .bind(size_bytes)
                .bind(mime_type)
                .bind(archived_at)
                .bind(expires_at)
                .execute(&self.db)
                .await?
            }
            ArchiveTransition::Restored { at, location } => {
                sqlx::query(
                    r#"
                    UPDATE archived_files
                    SET status = $3, restored_at = $4, restored_location = $5, updated_at = NOW()
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(from)
                .bind(to)
                .bind(at)
                .bind(location)
                .execute(&self.db)
                .await?
            }
            ArchiveTransition::Deleted { at } => {
                sqlx::query(
                    r#"
                    UPDATE archived_files
                    SET status = $3, deleted_at = $4, updated_at = NOW()
                    WHERE id = $1 AND status = ANY($2)
                    "#,
                )
                .bind(id)
                .bind(from)
                .bind(to)
                .bind(at)
                .execute(&self.db)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    async fn update_storage_location(
        &self,
        id: Uuid,
        key: &str,
        url: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE archived_files SET storage_key = $2, storage_url = $3, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(key)
        .bind(url)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ArchivedFile>, AppError> {
        let sql = format!(
            "SELECT {} FROM archived_files WHERE status = 'archived' AND expires_at <= $1 \
             ORDER BY expires_at LIMIT $2",
            ARCHIVE_COLUMNS
        );
        let files = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(now)
            .bind(limit)
            .fetch_all(&self.db)
            .await?;

        Ok(files)
    }

    async fn list_expiring_within(
        &self,
        now: DateTime<Utc>,
        days: i64,
    ) -> Result<Vec<ArchivedFile>, AppError> {
        let sql = format!(
            "SELECT {} FROM archived_files WHERE status = 'archived' AND expires_at > $1 \
             AND expires_at <= $2 ORDER BY expires_at",
            ARCHIVE_COLUMNS
        );
        let files = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(now)
            .bind(now + Duration::days(days))
            .fetch_all(&self.db)
            .await?;

        Ok(files)
    }

    async fn record_warning(&self, id: Uuid, days: i32) -> Result<(), AppError> {
        sqlx::query("UPDATE archived_files SET last_warning_days = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(days)
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn list_staged_before(&self, before: DateTime<Utc>) -> Result<Vec<ArchivedFile>, AppError> {
        let sql = format!(
            "SELECT {} FROM archived_files WHERE status = 'staged' AND created_at < $1 ORDER BY created_at",
            ARCHIVE_COLUMNS
        );
        let files = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(before)
            .fetch_all(&self.db)
            .await?;

        Ok(files)
    }

    async fn list_by_status(
        &self,
        tenant_id: Option<Uuid>,
        status: ArchiveStatus,
    ) -> Result<Vec<ArchivedFile>, AppError> {
        let sql = format!(
            "SELECT {} FROM archived_files WHERE status = $1 AND ($2::uuid IS NULL OR tenant_id = $2) \
             ORDER BY archived_at DESC",
            ARCHIVE_COLUMNS
        );
        let files = sqlx::query_as::<_, ArchivedFile>(&sql)
            .bind(status)
            .bind(tenant_id)
            .fetch_all(&self.db)
            .await?;

        Ok(files)
    }

    async fn usage_by_tenant(&self) -> Result<Vec<TenantArchiveUsage>, AppError> {
        let usage = sqlx::query_as::<_, TenantArchiveUsage>(
            r#"
            SELECT tenant_id,
                   COALESCE(SUM(size_bytes), 0)::BIGINT AS archived_bytes,
                   COUNT(*) AS archive_count
            FROM archived_files
            WHERE status = 'archived'
            GROUP BY tenant_id
            ORDER BY archived_bytes DESC
            "#,
        )
        .fetch_all(&self.db)
        .await?;

        Ok(usage)
    }
}
