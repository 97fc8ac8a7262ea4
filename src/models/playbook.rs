//! Playbook domain models
//! 修复剧本、剧本条目及其状态机

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::audit::SharePermission;
use super::integration::Platform;

/// 影响类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "impact_category", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImpactCategory {
    Security,
    Savings,
    Efficiency,
}

/// 风险等级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "risk_level", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// 剧本种类（生成规则）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "playbook_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PlaybookKind {
    Duplicates,
    PublicExposure,
    StaleFiles,
    DormantChannels,
    GuestUsers,
}

/// 剧本状态
///
/// PENDING → (APPROVED) → EXECUTING → EXECUTED | FAILED；
/// PENDING / APPROVED → DISMISSED（终态）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "playbook_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlaybookStatus {
    Pending,
    Approved,
    Executing,
    Executed,
    Failed,
    Dismissed,
}

impl PlaybookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlaybookStatus::Pending => "pending",
            PlaybookStatus::Approved => "approved",
            PlaybookStatus::Executing => "executing",
            PlaybookStatus::Executed => "executed",
            PlaybookStatus::Failed => "failed",
            PlaybookStatus::Dismissed => "dismissed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PlaybookStatus::Executed | PlaybookStatus::Failed | PlaybookStatus::Dismissed
        )
    }

    /// 状态机允许的转换
    pub fn can_transition_to(&self, next: PlaybookStatus) -> bool {
        use PlaybookStatus::*;
        matches!(
            (self, next),
            (Pending, Approved)
                | (Pending, Executing)
                | (Approved, Executing)
                | (Executing, Executed)
                | (Executing, Failed)
                | (Pending, Dismissed)
                | (Approved, Dismissed)
        )
    }
}

impl std::fmt::Display for PlaybookStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "item_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    File,
    Channel,
    User,
}

/// 条目元数据：生成时捕获的原始状态，执行与撤销依赖这些字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemMetadata {
    File {
        original_path: String,
        parent_id: Option<String>,
        size_bytes: i64,
        file_type: String,
        content_hash: Option<String>,
        last_accessed: Option<DateTime<Utc>>,
        owner: Option<String>,
        duplicate_group: Option<String>,
        is_public: bool,
        #[serde(default)]
        sharing: Vec<SharePermission>,
    },
    Channel {
        is_private: bool,
        member_count: i64,
        last_activity: Option<DateTime<Utc>>,
    },
    User {
        email: Option<String>,
        role: String,
        license_type: Option<String>,
        group_id: Option<String>,
        is_guest: bool,
        last_active: Option<DateTime<Utc>>,
    },
}

impl ItemMetadata {
    pub fn item_type(&self) -> ItemType {
        match self {
            ItemMetadata::File { .. } => ItemType::File,
            ItemMetadata::Channel { .. } => ItemType::Channel,
            ItemMetadata::User { .. } => ItemType::User,
        }
    }
}

/// 剧本
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Playbook {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub audit_result_id: Option<Uuid>,
    pub kind: PlaybookKind,
    pub title: String,
    pub description: String,
    pub impact: ImpactCategory,
    pub source: Platform,
    pub risk: RiskLevel,
    pub item_count: i32,
    pub estimated_savings: f64,
    pub status: PlaybookStatus,
    pub auto_approvable: bool,
    pub processed_count: i32,
    pub failed_count: i32,
    pub execution_duration_ms: Option<i64>,
    pub approved_by: Option<Uuid>,
    pub executed_by: Option<Uuid>,
    pub executed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 剧本条目
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PlaybookItem {
    pub id: Uuid,
    pub playbook_id: Uuid,
    pub item_name: String,
    pub item_type: ItemType,
    pub external_id: String,
    pub metadata: Json<ItemMetadata>,
    pub is_selected: bool,
    pub created_at: DateTime<Utc>,
}

/// 生成器产出的剧本草稿（尚未持久化）
#[derive(Debug, Clone)]
pub struct PlaybookDraft {
    pub playbook: Playbook,
    pub items: Vec<PlaybookItem>,
}

/// 条目选择请求
#[derive(Debug, Deserialize, validator::Validate)]
pub struct SelectItemRequest {
    pub is_selected: bool,
}

/// 剧本执行结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub playbook_id: Uuid,
    pub audit_log_id: Option<Uuid>,
    pub status: PlaybookStatus,
    pub processed: i32,
    pub failed: i32,
    pub skipped: bool,
    pub duration_ms: i64,
    pub message: Option<String>,
}
