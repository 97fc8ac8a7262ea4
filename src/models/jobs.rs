//! Background job contracts
//! 外部调度器投递的事件与处理结果

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use uuid::Uuid;

use super::integration::Platform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRunEvent {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationsSyncEvent {
    pub tenant_id: Uuid,
    pub user_id: Option<Uuid>,
    /// 只同步某个平台（webhook 提示时）
    pub source: Option<Platform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaybookExecuteEvent {
    pub playbook_id: Uuid,
    pub user_id: Uuid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveFileEvent {
    pub archive_id: Uuid,
    pub tenant_id: Uuid,
    pub file_name: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub days_remaining: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveBatchEvent {
    pub archive_ids: Vec<Uuid>,
    pub tenant_id: Uuid,
    pub user_id: Uuid,
}

/// 作业事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", content = "data")]
pub enum JobEvent {
    #[serde(rename = "audit/run")]
    AuditRun(AuditRunEvent),
    #[serde(rename = "integrations/sync")]
    IntegrationsSync(IntegrationsSyncEvent),
    #[serde(rename = "playbook/execute")]
    PlaybookExecute(PlaybookExecuteEvent),
    #[serde(rename = "archive/file.created")]
    ArchiveFileCreated(ArchiveFileEvent),
    #[serde(rename = "archive/file.restored")]
    ArchiveFileRestored(ArchiveFileEvent),
    #[serde(rename = "archive/file.expiring")]
    ArchiveFileExpiring(ArchiveFileEvent),
    #[serde(rename = "archive/batch.restore")]
    ArchiveBatchRestore(ArchiveBatchEvent),
    #[serde(rename = "archive/batch.delete")]
    ArchiveBatchDelete(ArchiveBatchEvent),
    #[serde(rename = "archive/migrate.storage")]
    ArchiveMigrateStorage(ArchiveBatchEvent),
    // 定时触发
    #[serde(rename = "archive/expiry.warn")]
    ArchiveExpiryWarn,
    #[serde(rename = "archive/expiry.sweep")]
    ArchiveExpirySweep,
    #[serde(rename = "archive/health.check")]
    ArchiveHealthCheck,
    #[serde(rename = "playbook/automation.run")]
    AutomationRun,
    #[serde(rename = "monitor/failures")]
    FailureMonitor,
}

impl JobEvent {
    pub fn name(&self) -> &'static str {
        match self {
            JobEvent::AuditRun(_) => "audit/run",
            JobEvent::IntegrationsSync(_) => "integrations/sync",
            JobEvent::PlaybookExecute(_) => "playbook/execute",
            JobEvent::ArchiveFileCreated(_) => "archive/file.created",
            JobEvent::ArchiveFileRestored(_) => "archive/file.restored",
            JobEvent::ArchiveFileExpiring(_) => "archive/file.expiring",
            JobEvent::ArchiveBatchRestore(_) => "archive/batch.restore",
            JobEvent::ArchiveBatchDelete(_) => "archive/batch.delete",
            JobEvent::ArchiveMigrateStorage(_) => "archive/migrate.storage",
            JobEvent::ArchiveExpiryWarn => "archive/expiry.warn",
            JobEvent::ArchiveExpirySweep => "archive/expiry.sweep",
            JobEvent::ArchiveHealthCheck => "archive/health.check",
            JobEvent::AutomationRun => "playbook/automation.run",
            JobEvent::FailureMonitor => "monitor/failures",
        }
    }

    /// 事件自带的天然幂等键；没有时由投递方的事件 ID 决定
    pub fn natural_key(&self) -> Option<String> {
        match self {
            JobEvent::PlaybookExecute(e) => Some(format!("{}:{}", self.name(), e.playbook_id)),
            JobEvent::ArchiveFileCreated(e)
            | JobEvent::ArchiveFileRestored(e) => Some(format!("{}:{}", self.name(), e.archive_id)),
            JobEvent::ArchiveFileExpiring(e) => Some(format!(
                "{}:{}:{}",
                self.name(),
                e.archive_id,
                e.days_remaining.unwrap_or_default()
            )),
            _ => None,
        }
    }

    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            JobEvent::AuditRun(e) => Some(e.tenant_id),
            JobEvent::IntegrationsSync(e) => Some(e.tenant_id),
            JobEvent::ArchiveFileCreated(e)
            | JobEvent::ArchiveFileRestored(e)
            | JobEvent::ArchiveFileExpiring(e) => Some(e.tenant_id),
            JobEvent::ArchiveBatchRestore(e)
            | JobEvent::ArchiveBatchDelete(e)
            | JobEvent::ArchiveMigrateStorage(e) => Some(e.tenant_id),
            _ => None,
        }
    }
}

/// 调度器投递的信封
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    /// 投递方的事件 ID（重投时保持不变）
    pub id: Option<String>,
    #[serde(flatten)]
    pub event: JobEvent,
}

impl JobEnvelope {
    pub fn new(event: JobEvent) -> Self {
        Self { id: None, event }
    }

    pub fn idempotency_key(&self) -> String {
        if let Some(key) = self.event.natural_key() {
            return key;
        }
        match &self.id {
            Some(id) => format!("{}:{}", self.event.name(), id),
            None => format!("{}:{}", self.event.name(), Uuid::new_v4()),
        }
    }
}

/// 作业处理结果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub success: bool,
    pub processed: i64,
    pub failed: i64,
    pub message: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl JobOutcome {
    pub fn ok(processed: i64, failed: i64) -> Self {
        Self {
            success: true,
            processed,
            failed,
            ..Default::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

/// 作业运行状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "job_run_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobRunStatus {
    Running,
    Completed,
    Failed,
}

/// 持久化的作业运行（步骤游标）
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRun {
    pub id: Uuid,
    pub job_key: String,
    pub event_name: String,
    pub tenant_id: Option<Uuid>,
    pub status: JobRunStatus,
    pub attempts: i32,
    /// 已完成步骤 → 步骤输出
    pub completed_steps: Json<serde_json::Map<String, serde_json::Value>>,
    pub outcome: Option<Json<JobOutcome>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_event_wire_format() {
        let json = serde_json::json!({
            "name": "playbook/execute",
            "data": { "playbookId": "7f1e5f38-4c3f-4c6e-9d67-3d1f5c0f6a11", "userId": "0b3c8f5e-2f4e-4e55-9f7c-7e1d1c9f7f10" }
        });
        let event: JobEvent = serde_json::from_value(json).unwrap();
        assert_eq!(event.name(), "playbook/execute");
        assert_eq!(
            event.natural_key().unwrap(),
            "playbook/execute:7f1e5f38-4c3f-4c6e-9d67-3d1f5c0f6a11"
        );
    }

    #[test]
    fn test_unit_event_without_data() {
        let event: JobEvent =
            serde_json::from_value(serde_json::json!({ "name": "archive/expiry.sweep" })).unwrap();
        assert_eq!(event, JobEvent::ArchiveExpirySweep);
    }

    #[test]
    fn test_envelope_key_uses_delivery_id() {
        let envelope: JobEnvelope = serde_json::from_value(serde_json::json!({
            "id": "evt-42",
            "name": "archive/expiry.sweep"
        }))
        .unwrap();
        assert_eq!(envelope.idempotency_key(), "archive/expiry.sweep:evt-42");
    }
}
