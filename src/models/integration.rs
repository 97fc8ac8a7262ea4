//! Integration domain models
//! 平台标识、凭证包与集成记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use std::collections::HashMap;
use uuid::Uuid;

/// 外部平台
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "platform", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    /// 即时通讯
    Slack,
    /// 云盘 / 目录
    GoogleWorkspace,
    /// 文档
    Notion,
    /// 设计
    Figma,
    /// 缺陷 / 需求跟踪
    Jira,
}

impl Platform {
    pub const ALL: [Platform; 5] = [
        Platform::Slack,
        Platform::GoogleWorkspace,
        Platform::Notion,
        Platform::Figma,
        Platform::Jira,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Slack => "slack",
            Platform::GoogleWorkspace => "google_workspace",
            Platform::Notion => "notion",
            Platform::Figma => "figma",
            Platform::Jira => "jira",
        }
    }

    /// 是否为聊天平台（只有聊天平台参与休眠频道规则）
    pub fn is_chat(&self) -> bool {
        matches!(self, Platform::Slack)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Platform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "slack" => Ok(Platform::Slack),
            "google_workspace" | "google" | "google_drive" => Ok(Platform::GoogleWorkspace),
            "notion" => Ok(Platform::Notion),
            "figma" => Ok(Platform::Figma),
            "jira" => Ok(Platform::Jira),
            other => Err(format!("Unknown platform: {}", other)),
        }
    }
}

/// 集成同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "sync_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

/// 凭证包
///
/// 由集成记录持有，刷新令牌后整体轮换
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectorConfig {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub tenant_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    /// 平台相关的元数据（团队 ID、云 ID、域名、OAuth 客户端等）
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl ConnectorConfig {
    pub fn new(tenant_id: Uuid, access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            tenant_id,
            ..Default::default()
        }
    }

    /// 读取字符串类型的元数据
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// 访问令牌是否会在 `skew_secs` 内过期
    pub fn expires_within(&self, now: DateTime<Utc>, skew_secs: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + chrono::Duration::seconds(skew_secs),
            None => false,
        }
    }
}

/// 集成记录
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Integration {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub platform: Platform,
    pub is_active: bool,
    #[serde(skip_serializing)]
    pub credentials: Json<ConnectorConfig>,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Integration {
    pub fn new(tenant_id: Uuid, platform: Platform, credentials: ConnectorConfig) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id,
            platform,
            is_active: true,
            credentials: Json(credentials),
            sync_status: SyncStatus::Idle,
            last_synced_at: None,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}
