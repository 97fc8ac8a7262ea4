//! Audit repository (审计结果数据访问)

use async_trait::async_trait;
use sqlx::{types::Json, PgPool, Postgres, Row, Transaction};
use uuid::Uuid;

use super::{AuditBundle, AuditStore};
use crate::{
    error::AppError,
    models::audit::{AuditResult, FileRecord, SharePermission},
    models::playbook::{Playbook, PlaybookItem},
};

pub struct PgAuditStore {
    db: PgPool,
}

impl PgAuditStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    async fn insert_result(
        tx: &mut Transaction<'_, Postgres>,
        result: &AuditResult,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_results (
                id, tenant_id, triggered_by, score, estimated_savings, realized_savings, waste,
                active_risks, critical_risks, moderate_risks, platforms, file_count,
                playbook_count, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            "#,
        )
        .bind(result.id)
        .bind(result.tenant_id)
        .bind(result.triggered_by)
        .bind(result.score)
        .bind(result.estimated_savings)
        .bind(result.realized_savings)
        .bind(&result.waste)
        .bind(result.active_risks)
        .bind(result.critical_risks)
        .bind(result.moderate_risks)
        .bind(&result.platforms)
        .bind(result.file_count)
        .bind(result.playbook_count)
        .bind(result.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_file(
        tx: &mut Transaction<'_, Postgres>,
        audit_result_id: Uuid,
        file: &FileRecord,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO file_records (
                audit_result_id, external_id, name, size_bytes, file_type, source, content_hash,
                path, parent_id, last_accessed, owner, is_public, shared_with, is_duplicate,
                duplicate_group
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(audit_result_id)
        .bind(&file.external_id)
        .bind(&file.name)
        .bind(file.size_bytes)
        .bind(&file.file_type)
        .bind(file.source)
        .bind(&file.content_hash)
        .bind(&file.path)
        .bind(&file.parent_id)
        .bind(file.last_accessed)
        .bind(&file.owner)
        .bind(file.is_public)
        .bind(Json(&file.shared_with))
        .bind(file.is_duplicate)
        .bind(&file.duplicate_group)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_playbook(
        tx: &mut Transaction<'_, Postgres>,
        playbook: &Playbook,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO playbooks (
                id, tenant_id, audit_result_id, kind, title, description, impact, source, risk,
                item_count, estimated_savings, status, auto_approvable, processed_count,
                failed_count, execution_duration_ms, approved_by, executed_by, executed_at,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21)
            "#,
        )
        .bind(playbook.id)
        .bind(playbook.tenant_id)
        .bind(playbook.audit_result_id)
        .bind(playbook.kind)
        .bind(&playbook.title)
        .bind(&playbook.description)
        .bind(playbook.impact)
        .bind(playbook.source)
        .bind(playbook.risk)
        .bind(playbook.item_count)
        .bind(playbook.estimated_savings)
        .bind(playbook.status)
        .bind(playbook.auto_approvable)
        .bind(playbook.processed_count)
        .bind(playbook.failed_count)
        .bind(playbook.execution_duration_ms)
        .bind(playbook.approved_by)
        .bind(playbook.executed_by)
        .bind(playbook.executed_at)
        .bind(playbook.created_at)
        .bind(playbook.updated_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn insert_item(
        tx: &mut Transaction<'_, Postgres>,
        item: &PlaybookItem,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO playbook_items (
                id, playbook_id, item_name, item_type, external_id, metadata, is_selected, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(item.id)
        .bind(item.playbook_id)
        .bind(&item.item_name)
        .bind(item.item_type)
        .bind(&item.external_id)
        .bind(&item.metadata)
        .bind(item.is_selected)
        .bind(item.created_at)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl AuditStore for PgAuditStore {
    async fn persist_audit(&self, bundle: &AuditBundle) -> Result<(), AppError> {
        let mut tx = self.db.begin().await?;

        Self::insert_result(&mut tx, &bundle.result).await?;
        for file in &bundle.files {
            Self::insert_file(&mut tx, bundle.result.id, file).await?;
        }
        for draft in &bundle.playbooks {
            Self::insert_playbook(&mut tx, &draft.playbook).await?;
            for item in &draft.items {
                Self::insert_item(&mut tx, item).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_audit_result(&self, id: Uuid) -> Result<Option<AuditResult>, AppError> {
        let result = sqlx::query_as::<_, AuditResult>(
            r#"
            SELECT id, tenant_id, triggered_by, score, estimated_savings, realized_savings, waste,
                   active_risks, critical_risks, moderate_risks, platforms, file_count,
                   playbook_count, created_at
            FROM audit_results
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(result)
    }

    async fn list_file_records(&self, audit_result_id: Uuid) -> Result<Vec<FileRecord>, AppError> {
        let rows = sqlx::query(
            r#"
            SELECT external_id, name, size_bytes, file_type, source, content_hash, path,
                   parent_id, last_accessed, owner, is_public, shared_with, is_duplicate,
                   duplicate_group
            FROM file_records
            WHERE audit_result_id = $1
            ORDER BY id
            "#,
        )
        .bind(audit_result_id)
        .fetch_all(&self.db)
        .await?;

        let mut files = Vec::with_capacity(rows.len());
        for row in rows {
            let shared_with: Json<Vec<SharePermission>> = row.try_get("shared_with")?;
            files.push(FileRecord {
                external_id: row.try_get("external_id")?,
                name: row.try_get("name")?,
                size_bytes: row.try_get("size_bytes")?,
                file_type: row.try_get("file_type")?,
                source: row.try_get("source")?,
                content_hash: row.try_get("content_hash")?,
                path: row.try_get("path")?,
                parent_id: row.try_get("parent_id")?,
                last_accessed: row.try_get("last_accessed")?,
                owner: row.try_get("owner")?,
                is_public: row.try_get("is_public")?,
                shared_with: shared_with.0,
                is_duplicate: row.try_get("is_duplicate")?,
                duplicate_group: row.try_get("duplicate_group")?,
            });
        }

        Ok(files)
    }

    async fn add_realized_savings(&self, id: Uuid, amount: f64) -> Result<(), AppError> {
        sqlx::query("UPDATE audit_results SET realized_savings = realized_savings + $2 WHERE id = $1")
            .bind(id)
            .bind(amount)
            .execute(&self.db)
            .await?;

        Ok(())
    }
}
