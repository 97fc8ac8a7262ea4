//! 统一错误模型
//! 定义所有错误类型和错误响应格式

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::connectors::{ConnectorError, OperationError, TokenError};

/// 结果类型别名
pub type Result<T> = std::result::Result<T, AppError>;

/// 应用错误类型
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed")]
    Unauthorized,

    #[error("Access denied")]
    Forbidden,

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// 状态机拒绝的转换（例如对已执行的剧本再次执行）
    #[error("Conflict: {0}")]
    Conflict(String),

    /// 撤销 / 恢复窗口已过
    #[error("Expired: {0}")]
    Expired(String),

    /// 平台不具备该能力
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Connector error: {0}")]
    Connector(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// 获取 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Forbidden => StatusCode::FORBIDDEN,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Expired(_) => StatusCode::GONE,
            AppError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Connector(_) => StatusCode::BAD_GATEWAY,
            AppError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            AppError::Database(_)
            | AppError::Config(_)
            | AppError::Storage(_)
            | AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// 获取用户友好的错误消息（不包含敏感信息）
    pub fn user_message(&self) -> String {
        match self {
            AppError::Unauthorized => "Authentication failed".to_string(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::NotFound(msg) => format!("Resource not found: {}", msg),
            AppError::BadRequest(msg) | AppError::Validation(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::Expired(msg) => msg.clone(),
            AppError::Unsupported(msg) => msg.clone(),
            AppError::Connector(msg) => format!("Upstream platform error: {}", msg),
            AppError::Storage(_) => "Archive storage error".to_string(),
            AppError::Timeout(msg) => format!("Request timeout: {}", msg),
            AppError::Database(_) => "Database error occurred".to_string(),
            AppError::Config(_) => "Configuration error".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    /// 获取错误码
    pub fn code(&self) -> u16 {
        self.status_code().as_u16()
    }

    // 便捷方法
    pub fn not_found(msg: &str) -> Self {
        AppError::NotFound(msg.to_string())
    }

    pub fn validation(msg: &str) -> Self {
        AppError::Validation(msg.to_string())
    }

    pub fn conflict(msg: &str) -> Self {
        AppError::Conflict(msg.to_string())
    }

    pub fn database(msg: &str) -> Self {
        AppError::Internal(format!("Database error: {}", msg))
    }

    pub fn internal_error(msg: &str) -> Self {
        AppError::Internal(msg.to_string())
    }
}

/// 错误响应 DTO
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Serialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
    pub request_id: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let error_response = ErrorResponse {
            error: ErrorDetail {
                code: self.code(),
                message: self.user_message(),
                request_id,
            },
        };

        tracing::error!(
            code = self.code(),
            message = %self,
            request_id = %error_response.error.request_id,
            "Application error"
        );

        (status, Json(error_response)).into_response()
    }
}

impl From<config::ConfigError> for AppError {
    fn from(e: config::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl From<ConnectorError> for AppError {
    fn from(e: ConnectorError) -> Self {
        if e.code == "timeout" {
            AppError::Timeout(e.message)
        } else {
            AppError::Connector(e.to_string())
        }
    }
}

impl From<TokenError> for AppError {
    fn from(e: TokenError) -> Self {
        AppError::Connector(e.to_string())
    }
}

impl From<OperationError> for AppError {
    fn from(e: OperationError) -> Self {
        match e {
            OperationError::Unsupported { .. } => AppError::Unsupported(e.to_string()),
            OperationError::InvalidTarget(msg) => AppError::Validation(msg),
            OperationError::Connector(inner) => inner.into(),
            OperationError::Token(inner) => inner.into(),
        }
    }
}

impl From<crate::concurrency::ConcurrencyError> for AppError {
    fn from(e: crate::concurrency::ConcurrencyError) -> Self {
        AppError::Conflict(format!("Concurrency error: {}", e))
    }
}

impl From<crate::services::archive_service::ArchiveError> for AppError {
    fn from(e: crate::services::archive_service::ArchiveError) -> Self {
        use crate::services::archive_service::ArchiveError;
        match e {
            ArchiveError::NotFound(id) => AppError::NotFound(format!("Archive {}", id)),
            ArchiveError::Deleted(_) | ArchiveError::InvalidState { .. } => {
                AppError::Conflict(e.to_string())
            }
            ArchiveError::Expired { .. } => AppError::Expired(e.to_string()),
            ArchiveError::Download(inner) | ArchiveError::Upload(inner) => inner.into(),
            ArchiveError::BlobMissing(_) | ArchiveError::Storage(_) => {
                AppError::Storage(e.to_string())
            }
            ArchiveError::Persistence(inner) => inner,
        }
    }
}

impl From<crate::jobs::JobError> for AppError {
    fn from(e: crate::jobs::JobError) -> Self {
        use crate::jobs::JobError;
        match e {
            JobError::Step { source, .. } => source,
            JobError::Persistence(inner) => inner,
            JobError::Permanent(msg) => AppError::BadRequest(msg),
            JobError::QueueClosed => AppError::Internal(e.to_string()),
            JobError::StepOutput { .. } | JobError::AttemptsExhausted { .. } => {
                AppError::Internal(e.to_string())
            }
        }
    }
}

impl From<crate::webhooks::WebhookError> for AppError {
    fn from(e: crate::webhooks::WebhookError) -> Self {
        use crate::webhooks::WebhookError;
        match e {
            WebhookError::MissingSignature
            | WebhookError::InvalidSignature
            | WebhookError::StaleTimestamp => AppError::Unauthorized,
            WebhookError::UnknownIntegration(id) => AppError::NotFound(format!("Integration {}", id)),
            WebhookError::NotConfigured(_)
            | WebhookError::UnknownPlatform(_)
            | WebhookError::Malformed(_) => AppError::BadRequest(e.to_string()),
            WebhookError::Publish(inner) => inner.into(),
            WebhookError::Persistence(inner) => inner,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::Operation;
    use crate::models::integration::Platform;

    #[test]
    fn test_error_codes() {
        assert_eq!(AppError::Unauthorized.code(), 401);
        assert_eq!(AppError::Forbidden.code(), 403);
        assert_eq!(AppError::NotFound("test".to_string()).code(), 404);
        assert_eq!(AppError::Conflict("test".to_string()).code(), 409);
        assert_eq!(AppError::Expired("test".to_string()).code(), 410);
        assert_eq!(AppError::Unsupported("test".to_string()).code(), 422);
    }

    #[test]
    fn test_user_message_no_sensitive_info() {
        let error = AppError::Database(sqlx::Error::RowNotFound);
        let message = error.user_message();
        assert_eq!(message, "Database error occurred");
        assert!(!message.contains("sqlx"));
    }

    #[test]
    fn test_unsupported_operation_maps_to_422() {
        let err: AppError = OperationError::Unsupported {
            platform: Platform::Figma,
            operation: Operation::ArchiveFile,
        }
        .into();
        assert_eq!(err.code(), 422);
        assert!(err.user_message().contains("figma"));
    }

    #[test]
    fn test_archive_errors_map_to_http_semantics() {
        use crate::services::archive_service::ArchiveError;
        let id = uuid::Uuid::new_v4();
        assert_eq!(AppError::from(ArchiveError::NotFound(id)).code(), 404);
        assert_eq!(AppError::from(ArchiveError::Deleted(id)).code(), 409);
        let expired = ArchiveError::Expired {
            id,
            expires_at: chrono::Utc::now(),
        };
        assert_eq!(AppError::from(expired).code(), 410);
    }
}
