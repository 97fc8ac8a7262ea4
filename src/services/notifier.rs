//! 通知出口
//!
//! 邮件 / IM 投递由外部协作方负责，这里只定义接口和一个写日志的实现。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    /// 归档即将到期
    ArchiveExpiring {
        tenant_id: Uuid,
        archive_id: Uuid,
        file_name: String,
        days_remaining: i64,
        expires_at: DateTime<Utc>,
    },
    /// 作业用完重试次数
    JobFailed {
        job_key: String,
        event_name: String,
        attempts: i32,
        error: String,
    },
    /// 失败监控汇总
    FailureDigest {
        failed_jobs: Vec<String>,
        errored_integrations: Vec<Uuid>,
    },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// 只写结构化日志
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        match notification {
            Notification::ArchiveExpiring {
                tenant_id,
                archive_id,
                file_name,
                days_remaining,
                ..
            } => info!(
                tenant_id = %tenant_id,
                archive_id = %archive_id,
                file_name = %file_name,
                days_remaining,
                "Archive expiring soon"
            ),
            Notification::JobFailed {
                job_key,
                event_name,
                attempts,
                error,
            } => warn!(
                job_key = %job_key,
                event_name = %event_name,
                attempts,
                error = %error,
                "Job exhausted its retries"
            ),
            Notification::FailureDigest {
                failed_jobs,
                errored_integrations,
            } => warn!(
                failed_jobs = failed_jobs.len(),
                errored_integrations = errored_integrations.len(),
                "Failure monitor digest"
            ),
        }
        Ok(())
    }
}
