//! Tenant repository (租户数据访问)

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::TenantDirectory;
use crate::{error::AppError, models::tenant::Tenant};

pub struct PgTenantDirectory {
    db: PgPool,
}

impl PgTenantDirectory {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TenantDirectory for PgTenantDirectory {
    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>, AppError> {
        let tenant = sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, plan, automation_actor, created_at
            FROM tenants
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        Ok(tenant)
    }

    async fn list_tenants_with_plans(&self, plans: &[String]) -> Result<Vec<Tenant>, AppError> {
        let plans: Vec<String> = plans.iter().map(|p| p.to_lowercase()).collect();

        let tenants = sqlx::query_as::<_, Tenant>(
            r#"
            SELECT id, name, plan, automation_actor, created_at
            FROM tenants
            WHERE LOWER(plan) = ANY($1)
            ORDER BY created_at
            "#,
        )
        .bind(&plans)
        .fetch_all(&self.db)
        .await?;

        Ok(tenants)
    }
}
