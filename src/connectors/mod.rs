//! 平台连接器
//!
//! 每个外部平台一个实现，统一暴露审计拉取和（可选的）变更操作。
//! 平台不具备的变更操作返回 `OperationError::Unsupported`，调用方按变体匹配
//! 决定是跳过还是中止整批。

pub mod dedupe;
pub mod figma;
pub mod google_workspace;
pub mod http;
pub mod jira;
pub mod notion;
pub mod oauth;
pub mod registry;
pub mod slack;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::archive::RestoreUpload;
use crate::models::audit::{AuditData, SharePermission};
use crate::models::integration::{ConnectorConfig, Platform};
use crate::models::playbook::PlaybookItem;
use crate::models::undo::{
    RestoreAccess, RestoreChannel, RestoreFile, RestoreLicense, RestorePermissions, RestoreUser,
};

pub use registry::ConnectorRegistry;

/// 连接器操作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    ArchiveFile,
    RestoreFile,
    UpdatePermissions,
    RevokeAccess,
    RestoreAccess,
    RestorePermissions,
    RestoreUser,
    RestoreLicense,
    ArchiveChannel,
    RestoreChannel,
    RemoveGuest,
    DownloadFile,
    UploadFile,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::ArchiveFile => "archive_file",
            Operation::RestoreFile => "restore_file",
            Operation::UpdatePermissions => "update_permissions",
            Operation::RevokeAccess => "revoke_access",
            Operation::RestoreAccess => "restore_access",
            Operation::RestorePermissions => "restore_permissions",
            Operation::RestoreUser => "restore_user",
            Operation::RestoreLicense => "restore_license",
            Operation::ArchiveChannel => "archive_channel",
            Operation::RestoreChannel => "restore_channel",
            Operation::RemoveGuest => "remove_guest",
            Operation::DownloadFile => "download_file",
            Operation::UploadFile => "upload_file",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 平台调用错误
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ConnectorError {
    pub code: String,
    pub message: String,
    pub status: Option<u16>,
    /// 服务端错误（5xx）或被限流（429）才可重试
    pub retryable: bool,
}

impl ConnectorError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            status: None,
            retryable: false,
        }
    }

    /// 根据 HTTP 状态码构造
    pub fn from_status(status: u16, body: impl Into<String>) -> Self {
        let code = match status {
            401 => "unauthorized".to_string(),
            403 => "forbidden".to_string(),
            404 => "not_found".to_string(),
            429 => "rate_limited".to_string(),
            s if s >= 500 => "server_error".to_string(),
            s => format!("http_{}", s),
        };
        Self {
            code,
            message: body.into(),
            status: Some(status),
            retryable: status == 429 || status >= 500,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            code: "timeout".to_string(),
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self {
            code: "network".to_string(),
            message: message.into(),
            status: None,
            retryable: true,
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::new("decode", message)
    }

    /// 平台在 200 响应里报告的业务错误（Slack 的 `ok: false` 等）
    pub fn api(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let retryable = code == "ratelimited" || code == "rate_limited";
        Self {
            code,
            message: message.into(),
            status: None,
            retryable,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self.status, Some(401) | Some(403))
            || matches!(self.code.as_str(), "invalid_auth" | "token_revoked" | "not_authed")
    }
}

/// 令牌刷新错误
#[derive(Debug, Clone, Error)]
pub enum TokenError {
    #[error("No refresh token stored for {0} integration")]
    MissingRefreshToken(Platform),

    /// 平台签发的是永久令牌，没有刷新流程
    #[error("{0} does not support token refresh")]
    RefreshUnsupported(Platform),

    #[error("Token refresh rejected by {platform}: {message}")]
    Rejected { platform: Platform, message: String },
}

/// 变更操作错误
#[derive(Debug, Clone, Error)]
pub enum OperationError {
    /// 平台根本不具备该能力（不是一次性失败）
    #[error("{operation} is not supported by {platform}")]
    Unsupported {
        platform: Platform,
        operation: Operation,
    },

    #[error(transparent)]
    Connector(#[from] ConnectorError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),
}

impl OperationError {
    pub fn unsupported(platform: Platform, operation: Operation) -> Self {
        OperationError::Unsupported {
            platform,
            operation,
        }
    }

    pub fn is_unsupported(&self) -> bool {
        matches!(self, OperationError::Unsupported { .. })
    }
}

pub type OpResult<T> = std::result::Result<T, OperationError>;

/// 刷新得到的新令牌
#[derive(Debug, Clone)]
pub struct TokenGrant {
    pub access_token: String,
    /// 平台轮换了刷新令牌时才有值
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl TokenGrant {
    /// 把新令牌写回凭证包
    pub fn apply_to(&self, config: &mut ConnectorConfig) {
        config.access_token = self.access_token.clone();
        if let Some(refresh_token) = &self.refresh_token {
            config.refresh_token = Some(refresh_token.clone());
        }
        config.expires_at = self.expires_at;
    }
}

/// 文件归档后的位置
#[derive(Debug, Clone, Default)]
pub struct ArchivedLocation {
    /// 文件被移入的归档目录（支持目录的平台）
    pub archive_folder_id: Option<String>,
}

/// 撤销访问的结果，决定生成哪种撤销动作
#[derive(Debug, Clone, PartialEq)]
pub enum RevokeOutcome {
    /// 删除了文件的公开共享
    PermissionsRemoved { original_sharing: Vec<SharePermission> },
    /// 把用户移出了授权组
    AccessRemoved {
        group_id: Option<String>,
        role: Option<String>,
        permissions: Option<Vec<String>>,
    },
    /// 停用了用户账号
    UserDeactivated {
        role: String,
        license_type: Option<String>,
    },
    /// 只回收了许可
    LicenseReleased { license_type: Option<String> },
}

/// 从平台下载的文件内容
#[derive(Debug, Clone)]
pub struct DownloadedFile {
    pub bytes: Vec<u8>,
    pub mime_type: Option<String>,
}

/// 平台连接器
#[async_trait]
pub trait Connector: Send + Sync {
    fn platform(&self) -> Platform;

    /// 轻量探活；正常的鉴权失败返回 false 而不是错误
    async fn test_connection(&self) -> bool;

    async fn refresh_token(&self) -> Result<TokenGrant, TokenError> {
        Err(TokenError::RefreshUnsupported(self.platform()))
    }

    /// 拉取审计数据；返回前必须已经标记好重复文件
    async fn fetch_audit_data(&self) -> Result<AuditData, ConnectorError>;

    async fn archive_file(&self, _item: &PlaybookItem) -> OpResult<ArchivedLocation> {
        Err(OperationError::unsupported(self.platform(), Operation::ArchiveFile))
    }

    async fn restore_file(&self, _action: &RestoreFile) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RestoreFile))
    }

    async fn update_permissions(
        &self,
        _file_id: &str,
        _sharing: &[SharePermission],
    ) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::UpdatePermissions))
    }

    async fn revoke_access(&self, _item: &PlaybookItem) -> OpResult<RevokeOutcome> {
        Err(OperationError::unsupported(self.platform(), Operation::RevokeAccess))
    }

    async fn restore_access(&self, _action: &RestoreAccess) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RestoreAccess))
    }

    async fn restore_permissions(&self, action: &RestorePermissions) -> OpResult<()> {
        self.update_permissions(&action.file_id, &action.original_sharing)
            .await
            .map_err(|e| match e {
                OperationError::Unsupported { platform, .. } => {
                    OperationError::unsupported(platform, Operation::RestorePermissions)
                }
                other => other,
            })
    }

    async fn restore_user(&self, _action: &RestoreUser) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RestoreUser))
    }

    async fn restore_license(&self, _action: &RestoreLicense) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RestoreLicense))
    }

    async fn archive_channel(&self, _item: &PlaybookItem) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::ArchiveChannel))
    }

    async fn restore_channel(&self, _action: &RestoreChannel) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RestoreChannel))
    }

    async fn remove_guest(&self, _item: &PlaybookItem) -> OpResult<()> {
        Err(OperationError::unsupported(self.platform(), Operation::RemoveGuest))
    }

    async fn download_file(&self, _file_id: &str) -> OpResult<DownloadedFile> {
        Err(OperationError::unsupported(self.platform(), Operation::DownloadFile))
    }

    /// 上传文件，返回平台侧的新 ID
    async fn upload_file(&self, _upload: &RestoreUpload) -> OpResult<String> {
        Err(OperationError::unsupported(self.platform(), Operation::UploadFile))
    }
}
