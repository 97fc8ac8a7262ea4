//! Archive domain models
//! 归档文件记录与保留期

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::integration::Platform;

/// 归档状态：STAGED → ARCHIVED → RESTORED | DELETED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "archive_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchiveStatus {
    Staged,
    Archived,
    Restored,
    Deleted,
}

/// 原始位置（恢复时默认回到这里）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalLocation {
    pub path: String,
    pub parent_id: Option<String>,
    pub owner: Option<String>,
}

/// 归档文件
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ArchivedFile {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub external_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub size_bytes: i64,
    pub content_sha256: Option<String>,
    pub storage_key: String,
    pub storage_url: Option<String>,
    pub status: ArchiveStatus,
    pub original_location: Json<OriginalLocation>,
    pub archived_by: Option<Uuid>,
    pub archived_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// 已发送的最小提醒天数（避免重复提醒）
    pub last_warning_days: Option<i32>,
    pub restored_at: Option<DateTime<Utc>>,
    pub restored_location: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ArchivedFile {
    /// 保留期到期时间：归档时间 + retention_days
    pub fn expiry_for(archived_at: DateTime<Utc>, retention_days: i64) -> DateTime<Utc> {
        archived_at + Duration::days(retention_days)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// 距离到期的剩余整天数（向下取整，已过期为 0）
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_days().max(0)
    }
}

/// 归档请求（由执行器或 API 发起）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveRequest {
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub external_id: String,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub original_location: OriginalLocation,
    pub requested_by: Option<Uuid>,
}

/// 恢复请求
#[derive(Debug, Clone, Default, Deserialize, validator::Validate)]
pub struct RestoreArchiveRequest {
    /// 目标位置（父目录 ID），为空时回到原始位置
    #[validate(length(min = 1, max = 1024))]
    pub target_location: Option<String>,
}

/// 推回源平台时交给上传回调的数据
#[derive(Debug, Clone)]
pub struct RestoreUpload {
    pub archive_id: Uuid,
    pub platform: Platform,
    pub file_name: String,
    pub mime_type: Option<String>,
    pub target_location: Option<String>,
    pub bytes: Vec<u8>,
}

/// 单租户用量
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TenantArchiveUsage {
    pub tenant_id: Uuid,
    pub archived_bytes: i64,
    pub archive_count: i64,
}

/// 归档健康检查报告
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveHealthReport {
    /// 数据库有记录但存储中缺失对象
    pub orphaned: Vec<Uuid>,
    /// 超过时限仍为 STAGED（上传从未完成）
    pub stuck_staged: Vec<Uuid>,
    /// 用量超过阈值的租户
    pub high_usage_tenants: Vec<TenantArchiveUsage>,
    pub checked: usize,
}

impl ArchiveHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.orphaned.is_empty() && self.stuck_staged.is_empty()
    }
}
