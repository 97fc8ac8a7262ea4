//! Integration repository (集成数据访问)

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{types::Json, PgPool};
use uuid::Uuid;

use super::IntegrationStore;
use crate::{
    error::AppError,
    models::integration::{ConnectorConfig, Integration, Platform, SyncStatus},
};

const INTEGRATION_COLUMNS: &str = "id, tenant_id, platform, is_active, credentials, sync_status, \
     last_synced_at, last_error, last_error_at, created_at, updated_at";

pub struct PgIntegrationStore {
    db: PgPool,
}

impl PgIntegrationStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// 新建集成（管理接口与测试数据使用）
    pub async fn insert_integration(&self, integration: &Integration) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO integrations (
                id, tenant_id, platform, is_active, credentials, sync_status,
                last_synced_at, last_error, last_error_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(integration.id)
        .bind(integration.tenant_id)
        .bind(integration.platform)
        .bind(integration.is_active)
        .bind(&integration.credentials)
        .bind(integration.sync_status)
        .bind(integration.last_synced_at)
        .bind(&integration.last_error)
        .bind(integration.last_error_at)
        .bind(integration.created_at)
        .bind(integration.updated_at)
        .execute(&self.db)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl IntegrationStore for PgIntegrationStore {
    async fn get_integration(&self, id: Uuid) -> Result<Option<Integration>, AppError> {
        let sql = format!("SELECT {} FROM integrations WHERE id = $1", INTEGRATION_COLUMNS);
        let integration = sqlx::query_as::<_, Integration>(&sql)
            .bind(id)
            .fetch_optional(&self.db)
            .await?;

        Ok(integration)
    }

    async fn list_active_integrations(&self, tenant_id: Uuid) -> Result<Vec<Integration>, AppError> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE tenant_id = $1 AND is_active ORDER BY platform",
            INTEGRATION_COLUMNS
        );
        let integrations = sqlx::query_as::<_, Integration>(&sql)
            .bind(tenant_id)
            .fetch_all(&self.db)
            .await?;

        Ok(integrations)
    }

    async fn find_active_integration(
        &self,
        tenant_id: Uuid,
        platform: Platform,
    ) -> Result<Option<Integration>, AppError> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE tenant_id = $1 AND platform = $2 AND is_active",
            INTEGRATION_COLUMNS
        );
        let integration = sqlx::query_as::<_, Integration>(&sql)
            .bind(tenant_id)
            .bind(platform)
            .fetch_optional(&self.db)
            .await?;

        Ok(integration)
    }

    async fn set_sync_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<(), AppError> {
        match status {
            SyncStatus::Syncing => {
                sqlx::query(
                    "UPDATE integrations SET sync_status = $2, updated_at = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(status)
                .bind(at)
                .execute(&self.db)
                .await?;
            }
            SyncStatus::Idle => {
                sqlx::query(
                    r#"
                    UPDATE integrations
                    SET sync_status = $2, last_synced_at = $3, last_error = NULL,
                        last_error_at = NULL, updated_at = $3
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(status)
                .bind(at)
                .execute(&self.db)
                .await?;
            }
            SyncStatus::Error => {
                sqlx::query(
                    r#"
                    UPDATE integrations
                    SET sync_status = $2, last_error = $3, last_error_at = $4, updated_at = $4
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .bind(status)
                .bind(error)
                .bind(at)
                .execute(&self.db)
                .await?;
            }
        }

        Ok(())
    }

    async fn update_credentials(&self, id: Uuid, credentials: &ConnectorConfig) -> Result<(), AppError> {
        sqlx::query("UPDATE integrations SET credentials = $2, updated_at = NOW() WHERE id = $1")
            .bind(id)
            .bind(Json(credentials))
            .execute(&self.db)
            .await?;

        Ok(())
    }

    async fn list_errored_integrations(&self) -> Result<Vec<Integration>, AppError> {
        let sql = format!(
            "SELECT {} FROM integrations WHERE is_active AND sync_status = 'error' ORDER BY last_error_at DESC",
            INTEGRATION_COLUMNS
        );
        let integrations = sqlx::query_as::<_, Integration>(&sql)
            .fetch_all(&self.db)
            .await?;

        Ok(integrations)
    }
}
