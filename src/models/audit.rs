//! Audit domain models
//! 归一化的文件 / 用户 / 频道记录与审计结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::integration::Platform;

/// 共享对象（某个主体对文件的访问权限）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharePermission {
    /// 平台侧的权限 ID（删除 / 恢复时需要）
    pub permission_id: Option<String>,
    /// anyone / domain / user / group
    pub principal_type: String,
    /// 邮箱、域名或空（anyone）
    pub principal: Option<String>,
    /// reader / commenter / writer ...
    pub role: String,
}

impl SharePermission {
    pub fn is_public(&self) -> bool {
        self.principal_type == "anyone"
    }
}

/// 文件记录（每次审计重新计算，不跨审计保留重复标记）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub external_id: String,
    pub name: String,
    pub size_bytes: i64,
    /// MIME 或平台对象类型（page / database / figma_file ...）
    pub file_type: String,
    pub source: Platform,
    pub content_hash: Option<String>,
    pub path: String,
    pub parent_id: Option<String>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub owner: Option<String>,
    pub is_public: bool,
    #[serde(default)]
    pub shared_with: Vec<SharePermission>,
    #[serde(default)]
    pub is_duplicate: bool,
    pub duplicate_group: Option<String>,
}

const DATABASE_EXTENSIONS: &[&str] = &[
    "db", "sql", "sqlite", "sqlite3", "mdb", "accdb", "dump", "bak", "dbf",
];

impl FileRecord {
    /// 重复分组键：优先内容哈希，否则退化为 名称+大小
    pub fn duplicate_key(&self) -> String {
        match &self.content_hash {
            Some(hash) if !hash.is_empty() => format!("hash:{}", hash),
            _ => format!("name:{}:{}", self.name.to_lowercase(), self.size_bytes),
        }
    }

    /// 是否为“类数据库”文件（公开暴露时视为严重风险）
    pub fn is_database_like(&self) -> bool {
        let file_type = self.file_type.to_lowercase();
        if file_type == "database"
            || file_type.contains("sql")
            || file_type.contains("database")
            || file_type.contains("x-msaccess")
        {
            return true;
        }

        self.name
            .rsplit_once('.')
            .map(|(_, ext)| DATABASE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
            .unwrap_or(false)
    }

    /// 最后访问时间早于 `now - days` 即为陈旧
    pub fn is_stale(&self, now: DateTime<Utc>, days: i64) -> bool {
        self.last_accessed
            .map(|t| t < now - chrono::Duration::days(days))
            .unwrap_or(false)
    }
}

/// 用户记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub external_id: String,
    pub email: Option<String>,
    pub name: String,
    pub role: String,
    pub source: Platform,
    pub last_active: Option<DateTime<Utc>>,
    pub is_guest: bool,
    pub is_admin: bool,
    pub license_type: Option<String>,
    /// 所属的产品访问组（Jira 等按组授权的平台）
    pub group_id: Option<String>,
}

impl UserRecord {
    /// 不活跃判定：最后活跃早于阈值；从未活跃也视为不活跃
    pub fn is_inactive(&self, now: DateTime<Utc>, days: i64) -> bool {
        match self.last_active {
            Some(t) => t <= now - chrono::Duration::days(days),
            None => true,
        }
    }
}

/// 频道记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub external_id: String,
    pub name: String,
    pub source: Platform,
    pub is_private: bool,
    pub is_archived: bool,
    pub member_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

/// 单个平台一次同步的产出
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditData {
    pub files: Vec<FileRecord>,
    pub users: Vec<UserRecord>,
    pub channels: Option<Vec<ChannelRecord>>,
    pub storage_used_gb: f64,
    pub total_licenses: i64,
    pub active_users: i64,
}

/// 浪费明细
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WasteBreakdown {
    /// 年化存储浪费（美元）
    pub storage_waste: f64,
    /// 年化许可浪费（美元）
    pub license_waste: f64,
    pub wasted_storage_mb: f64,
    pub duplicate_files: i64,
    pub stale_files: i64,
    pub public_files: i64,
    pub inactive_users: i64,
    pub guest_users: i64,
}

/// 风险计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskCounts {
    pub active_risks: i64,
    pub critical_risks: i64,
    pub moderate_risks: i64,
}

/// 审计结果（一次审计一条）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditResult {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub triggered_by: Option<Uuid>,
    pub score: i32,
    pub estimated_savings: f64,
    /// 已执行剧本兑现的节省
    pub realized_savings: f64,
    pub waste: Json<WasteBreakdown>,
    pub active_risks: i64,
    pub critical_risks: i64,
    pub moderate_risks: i64,
    pub platforms: Json<Vec<Platform>>,
    pub file_count: i64,
    pub playbook_count: i64,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, file_type: &str, hash: Option<&str>) -> FileRecord {
        FileRecord {
            external_id: name.to_string(),
            name: name.to_string(),
            size_bytes: 1024,
            file_type: file_type.to_string(),
            source: Platform::GoogleWorkspace,
            content_hash: hash.map(|h| h.to_string()),
            path: format!("/{}", name),
            parent_id: None,
            last_accessed: None,
            owner: None,
            is_public: false,
            shared_with: vec![],
            is_duplicate: false,
            duplicate_group: None,
        }
    }

    #[test]
    fn test_duplicate_key_prefers_hash() {
        assert_eq!(file("a.txt", "text/plain", Some("abc")).duplicate_key(), "hash:abc");
        assert_eq!(file("A.txt", "text/plain", None).duplicate_key(), "name:a.txt:1024");
        assert_eq!(file("A.txt", "text/plain", Some("")).duplicate_key(), "name:a.txt:1024");
    }

    #[test]
    fn test_database_like_detection() {
        assert!(file("prod.sql", "application/octet-stream", None).is_database_like());
        assert!(file("crm", "database", None).is_database_like());
        assert!(file("backup.SQLITE", "", None).is_database_like());
        assert!(!file("notes.txt", "text/plain", None).is_database_like());
    }

    #[test]
    fn test_user_without_activity_is_inactive() {
        let user = UserRecord {
            external_id: "U1".to_string(),
            email: None,
            name: "ghost".to_string(),
            role: "member".to_string(),
            source: Platform::Slack,
            last_active: None,
            is_guest: false,
            is_admin: false,
            license_type: None,
            group_id: None,
        };
        assert!(user.is_inactive(Utc::now(), 90));
    }
}
