//! Playbook repository (剧本数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::{PlaybookExecutionRecord, PlaybookStore};
use crate::{
    error::AppError,
    models::playbook::{Playbook, PlaybookItem, PlaybookStatus},
};

const PLAYBOOK_COLUMNS: &str = "id, tenant_id, audit_result_id, kind, title, description, impact, \
     source, risk, item_count, estimated_savings, status, auto_approvable, processed_count, \
     failed_count, execution_duration_ms, approved_by, executed_by, executed_at, created_at, updated_at";

const ITEM_COLUMNS: &str =
    "id, playbook_id, item_name, item_type, external_id, metadata, is_selected, created_at";

pub struct PgPlaybookStore {
    db: PgPool,
}

impl PgPlaybookStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PlaybookStore for PgPlaybookStore {
    async fn get_playbook(&self, id: Uuid) -> Result<Option<Playbook>, AppError> {
        let sql = format!("SELECT {} FROM playbooks WHERE id = $1", PLAYBOOK_COLUMNS);
        let playbook = sqlx::query_as::<_, Playbook>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(playbook)
    }

    async fn list_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM playbook_items WHERE playbook_id = $1 ORDER BY created_at, id",
            ITEM_COLUMNS
        );
        let items = sqlx::query_as::<_, PlaybookItem>(&sql)
            .bind(playbook_id)
            .fetch_all(&self.db)
            .await?;

        Ok(items)
    }

    async fn list_selected_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>, AppError> {
        let sql = format!(
            "SELECT {} FROM playbook_items WHERE playbook_id = $1 AND is_selected ORDER BY created_at, id",
            ITEM_COLUMNS
        );
        let items = sqlx::query_as::<_, PlaybookItem>(&sql)
            .bind(playbook_id)
            .fetch_all(&self.db)
            .await?;

        Ok(items)
    }

    async fn set_item_selected(
        &self,
        playbook_id: Uuid,
        item_id: Uuid,
        selected: bool,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            "UPDATE playbook_items SET is_selected = $3 WHERE id = $2 AND playbook_id = $1",
        )
        .bind(playbook_id)
        .bind(item_id)
        .bind(selected)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PlaybookStatus],
        to: PlaybookStatus,
        actor: Option<Uuid>,
    ) -> Result<bool, AppError> {
        // 审批人只在进入 APPROVED 时记录
        let result = sqlx::query(
            r#"
            UPDATE playbooks
            SET status = $3,
                approved_by = CASE WHEN $3 = 'approved'::playbook_status THEN $4 ELSE approved_by END,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to)
        .bind(actor)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn record_execution(
        &self,
        id: Uuid,
        record: &PlaybookExecutionRecord,
    ) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE playbooks
            SET status = $2, processed_count = $3, failed_count = $4, execution_duration_ms = $5,
                executed_by = $6, executed_at = $7, updated_at = NOW()
            WHERE id = $1 AND status = 'executing'
            "#,
        )
        .bind(id)
        .bind(record.status)
        .bind(record.processed)
        .bind(record.failed)
        .bind(record.duration_ms)
        .bind(record.executed_by)
        .bind(record.executed_at)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn list_auto_approvable_pending(&self, tenant_id: Uuid) -> Result<Vec<Playbook>, AppError> {
        let sql = format!(
            "SELECT {} FROM playbooks WHERE tenant_id = $1 AND status = 'pending' AND auto_approvable \
             ORDER BY created_at",
            PLAYBOOK_COLUMNS
        );
        let playbooks = sqlx::query_as::<_, Playbook>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.db)
            .await?;

        Ok(playbooks)
    }
}
