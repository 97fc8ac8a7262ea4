//! Tenant model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 租户（只保留自动化需要的字段）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    /// 套餐等级：free / team / business / enterprise
    pub plan: String,
    /// 自动执行的执行人（系统账号）
    pub automation_actor: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(name: impl Into<String>, plan: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            plan: plan.into(),
            automation_actor: None,
            created_at: Utc::now(),
        }
    }

    /// 套餐是否在允许列表中（大小写不敏感）
    pub fn plan_allowed(&self, allowed: &[String]) -> bool {
        allowed.iter().any(|p| p.eq_ignore_ascii_case(&self.plan))
    }
}
