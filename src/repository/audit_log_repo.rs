//! Undo ledger repository (审计日志条目数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::AuditLogStore;
use crate::{error::AppError, models::undo::AuditLogEntry};

const ENTRY_COLUMNS: &str = "id, tenant_id, playbook_id, parent_entry_id, action_type, target, \
     platform, executed_by, status, processed, failed, undo_actions, errors, undo_expires_at, \
     partial_undo, undone_at, undone_by, created_at";

pub struct PgAuditLogStore {
    db: PgPool,
}

impl PgAuditLogStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl AuditLogStore for PgAuditLogStore {
    async fn insert_entry(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO audit_log_entries (
                id, tenant_id, playbook_id, parent_entry_id, action_type, target, platform,
                executed_by, status, processed, failed, undo_actions, errors, undo_expires_at,
                partial_undo, undone_at, undone_by, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(entry.id)
        .bind(entry.tenant_id)
        .bind(entry.playbook_id)
        .bind(entry.parent_entry_id)
        .bind(entry.action_type)
        .bind(&entry.target)
        .bind(entry.platform)
        .bind(entry.executed_by)
        .bind(entry.status)
        .bind(entry.processed)
        .bind(entry.failed)
        .bind(&entry.undo_actions)
        .bind(&entry.errors)
        .bind(entry.undo_expires_at)
        .bind(entry.partial_undo)
        .bind(entry.undone_at)
        .bind(entry.undone_by)
        .bind(entry.created_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<AuditLogEntry>, AppError> {
        let sql = format!("SELECT {} FROM audit_log_entries WHERE id = $1", ENTRY_COLUMNS);
        let entry = sqlx::query_as::<_, AuditLogEntry>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(entry)
    }

    async fn find_by_playbook(&self, playbook_id: Uuid) -> Result<Option<AuditLogEntry>, AppError> {
        let sql = format!(
            "SELECT {} FROM audit_log_entries WHERE playbook_id = $1 AND parent_entry_id IS NULL",
            ENTRY_COLUMNS
        );
        let entry = sqlx::query_as::<_, AuditLogEntry>(&sql)
            .bind(playbook_id)
            .fetch_optional(&self.db)
            .await?;

        Ok(entry)
    }

    async fn update_entry(&self, entry: &AuditLogEntry) -> Result<(), AppError> {
        sqlx::query(
            r#"
            UPDATE audit_log_entries
            SET status = $2, processed = $3, failed = $4, undo_actions = $5, errors = $6,
                partial_undo = $7, undone_at = $8, undone_by = $9
            WHERE id = $1
            "#,
        )
        .bind(entry.id)
        .bind(entry.status)
        .bind(entry.processed)
        .bind(entry.failed)
        .bind(&entry.undo_actions)
        .bind(&entry.errors)
        .bind(entry.partial_undo)
        .bind(entry.undone_at)
        .bind(entry.undone_by)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}
