//! Undo ledger models
//! 审计日志条目与逐动作类型的撤销记录

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::audit::SharePermission;
use super::integration::Platform;
use super::playbook::ItemMetadata;

/// 撤销窗口（天）
pub const UNDO_WINDOW_DAYS: i64 = 30;

/// 计算撤销截止时间：动作时间 + 30 天
pub fn undo_deadline(action_at: DateTime<Utc>) -> DateTime<Utc> {
    action_at + Duration::days(UNDO_WINDOW_DAYS)
}

/// 执行的动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "action_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    RevokeAccess,
    ArchiveFile,
    ArchiveChannel,
    /// 单个撤销动作的独立记录
    UndoAction,
}

/// 日志条目的复合状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "log_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Pending,
    Success,
    Failed,
}

impl LogStatus {
    /// 全部失败 → FAILED；至少一个成功 → SUCCESS；什么都没跑 → PENDING
    pub fn from_counts(succeeded: usize, failed: usize) -> Self {
        if succeeded >= 1 {
            LogStatus::Success
        } else if failed >= 1 {
            LogStatus::Failed
        } else {
            LogStatus::Pending
        }
    }
}

/// 每个撤销动作都带的公共字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UndoMeta {
    pub executed_at: DateTime<Utc>,
    pub executed_by: Uuid,
    pub original_metadata: ItemMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreFile {
    pub file_id: String,
    pub file_name: String,
    pub original_path: String,
    pub original_parent_id: Option<String>,
    pub archive_folder_id: Option<String>,
    /// 若同时复制到了归档存储，对应的归档记录
    pub archive_id: Option<Uuid>,
    pub source: Platform,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreAccess {
    pub user_id: String,
    pub user_email: Option<String>,
    pub group_id: Option<String>,
    pub role: Option<String>,
    pub permissions: Option<Vec<String>>,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestorePermissions {
    pub file_id: String,
    pub file_name: String,
    pub original_sharing: Vec<SharePermission>,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreChannel {
    pub channel_id: String,
    pub channel_name: String,
    pub is_private: bool,
    pub member_count: i64,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreUser {
    pub user_id: String,
    pub user_email: Option<String>,
    pub role: String,
    pub license_type: Option<String>,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreLicense {
    pub user_id: String,
    pub user_email: Option<String>,
    pub license_type: Option<String>,
    #[serde(flatten)]
    pub meta: UndoMeta,
}

/// 撤销动作（只为前向动作成功的条目创建）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UndoAction {
    RestoreFile(RestoreFile),
    RestoreAccess(RestoreAccess),
    RestorePermissions(RestorePermissions),
    RestoreChannel(RestoreChannel),
    RestoreUser(RestoreUser),
    RestoreLicense(RestoreLicense),
}

impl UndoAction {
    pub fn kind(&self) -> &'static str {
        match self {
            UndoAction::RestoreFile(_) => "restore_file",
            UndoAction::RestoreAccess(_) => "restore_access",
            UndoAction::RestorePermissions(_) => "restore_permissions",
            UndoAction::RestoreChannel(_) => "restore_channel",
            UndoAction::RestoreUser(_) => "restore_user",
            UndoAction::RestoreLicense(_) => "restore_license",
        }
    }

    /// 被撤销对象的外部 ID
    pub fn target_id(&self) -> &str {
        match self {
            UndoAction::RestoreFile(a) => &a.file_id,
            UndoAction::RestoreAccess(a) => &a.user_id,
            UndoAction::RestorePermissions(a) => &a.file_id,
            UndoAction::RestoreChannel(a) => &a.channel_id,
            UndoAction::RestoreUser(a) => &a.user_id,
            UndoAction::RestoreLicense(a) => &a.user_id,
        }
    }

    pub fn meta(&self) -> &UndoMeta {
        match self {
            UndoAction::RestoreFile(a) => &a.meta,
            UndoAction::RestoreAccess(a) => &a.meta,
            UndoAction::RestorePermissions(a) => &a.meta,
            UndoAction::RestoreChannel(a) => &a.meta,
            UndoAction::RestoreUser(a) => &a.meta,
            UndoAction::RestoreLicense(a) => &a.meta,
        }
    }
}

/// 单个条目的失败记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub target_id: String,
    pub target_name: String,
    pub error: String,
}

/// 审计日志条目（每次剧本执行或单个撤销调用一条）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditLogEntry {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub playbook_id: Option<Uuid>,
    pub parent_entry_id: Option<Uuid>,
    pub action_type: ActionType,
    pub target: String,
    pub platform: Platform,
    pub executed_by: Uuid,
    pub status: LogStatus,
    pub processed: i32,
    pub failed: i32,
    pub undo_actions: Json<Vec<UndoAction>>,
    pub errors: Json<Vec<ItemFailure>>,
    pub undo_expires_at: Option<DateTime<Utc>>,
    pub partial_undo: bool,
    pub undone_at: Option<DateTime<Utc>>,
    pub undone_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl AuditLogEntry {
    /// 撤销窗口是否仍然开放（严格早于截止时间）
    pub fn undo_open_at(&self, now: DateTime<Utc>) -> bool {
        match self.undo_expires_at {
            Some(deadline) => now < deadline,
            None => false,
        }
    }
}

/// 撤销结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UndoReport {
    pub entry_id: Uuid,
    pub status: LogStatus,
    pub restored: i32,
    pub failed: i32,
    pub partial_undo: bool,
    pub errors: Vec<ItemFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_composite_status() {
        assert_eq!(LogStatus::from_counts(0, 0), LogStatus::Pending);
        assert_eq!(LogStatus::from_counts(0, 3), LogStatus::Failed);
        assert_eq!(LogStatus::from_counts(1, 3), LogStatus::Success);
        assert_eq!(LogStatus::from_counts(4, 0), LogStatus::Success);
    }

    #[test]
    fn test_undo_deadline_is_thirty_days() {
        let at = Utc::now();
        assert_eq!(undo_deadline(at) - at, Duration::days(30));
    }

    #[test]
    fn test_undo_action_tagging_flattens_meta() {
        let action = UndoAction::RestoreChannel(RestoreChannel {
            channel_id: "C1".to_string(),
            channel_name: "old-launch".to_string(),
            is_private: false,
            member_count: 2,
            meta: UndoMeta {
                executed_at: Utc::now(),
                executed_by: Uuid::new_v4(),
                original_metadata: ItemMetadata::Channel {
                    is_private: false,
                    member_count: 2,
                    last_activity: None,
                },
            },
        });

        let json = serde_json::to_value(&action).unwrap();
        assert_eq!(json["type"], "restore_channel");
        assert_eq!(json["channel_id"], "C1");
        assert!(json["executed_at"].is_string());
        assert_eq!(json["original_metadata"]["kind"], "channel");

        let back: UndoAction = serde_json::from_value(json).unwrap();
        assert_eq!(back, action);
    }
}
