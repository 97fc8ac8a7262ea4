//! Database repository layer
//!
//! 每个持久化关注点一个 trait；Postgres 实现用于服务进程，内存实现用于测试与本地演练。
//! 状态转换一律是 compare-and-set，重试的步骤不会重复提交同一次转换。

pub mod archive_repo;
pub mod audit_log_repo;
pub mod audit_repo;
pub mod integration_repo;
pub mod job_run_repo;
pub mod memory;
pub mod playbook_repo;
pub mod tenant_repo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::models::archive::{ArchiveStatus, ArchivedFile, TenantArchiveUsage};
use crate::models::audit::{AuditResult, FileRecord};
use crate::models::integration::{ConnectorConfig, Integration, Platform, SyncStatus};
use crate::models::jobs::{JobOutcome, JobRun, JobRunStatus};
use crate::models::playbook::{Playbook, PlaybookDraft, PlaybookItem, PlaybookStatus};
use crate::models::tenant::Tenant;
use crate::models::undo::AuditLogEntry;

pub use archive_repo::PgArchiveStore;
pub use audit_log_repo::PgAuditLogStore;
pub use audit_repo::PgAuditStore;
pub use integration_repo::PgIntegrationStore;
pub use job_run_repo::PgJobRunStore;
pub use memory::MemoryStore;
pub use playbook_repo::PgPlaybookStore;
pub use tenant_repo::PgTenantDirectory;

#[async_trait]
pub trait TenantDirectory: Send + Sync {
    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>>;

    /// 套餐在列表中的租户（大小写不敏感）
    async fn list_tenants_with_plans(&self, plans: &[String]) -> Result<Vec<Tenant>>;
}

#[async_trait]
pub trait IntegrationStore: Send + Sync {
    async fn get_integration(&self, id: Uuid) -> Result<Option<Integration>>;

    async fn list_active_integrations(&self, tenant_id: Uuid) -> Result<Vec<Integration>>;

    /// 租户在某平台上的有效集成
    async fn find_active_integration(
        &self,
        tenant_id: Uuid,
        platform: Platform,
    ) -> Result<Option<Integration>>;

    /// 更新同步状态：SYNCING 只改状态；IDLE 记录同步时间并清除错误；ERROR 记录错误
    async fn set_sync_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()>;

    async fn update_credentials(&self, id: Uuid, credentials: &ConnectorConfig) -> Result<()>;

    async fn list_errored_integrations(&self) -> Result<Vec<Integration>>;
}

/// 一次审计需要原子落库的全部内容
#[derive(Debug, Clone)]
pub struct AuditBundle {
    pub result: AuditResult,
    pub files: Vec<FileRecord>,
    pub playbooks: Vec<PlaybookDraft>,
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    /// 审计结果、文件记录、剧本及条目在一个事务里写入
    async fn persist_audit(&self, bundle: &AuditBundle) -> Result<()>;

    async fn get_audit_result(&self, id: Uuid) -> Result<Option<AuditResult>>;

    async fn list_file_records(&self, audit_result_id: Uuid) -> Result<Vec<FileRecord>>;

    async fn add_realized_savings(&self, id: Uuid, amount: f64) -> Result<()>;
}

/// 执行结束时写回剧本的数据
#[derive(Debug, Clone)]
pub struct PlaybookExecutionRecord {
    pub status: PlaybookStatus,
    pub processed: i32,
    pub failed: i32,
    pub duration_ms: i64,
    pub executed_by: Uuid,
    pub executed_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlaybookStore: Send + Sync {
    async fn get_playbook(&self, id: Uuid) -> Result<Option<Playbook>>;

    async fn list_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>>;

    async fn list_selected_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>>;

    /// 返回是否找到该条目
    async fn set_item_selected(&self, playbook_id: Uuid, item_id: Uuid, selected: bool) -> Result<bool>;

    /// compare-and-set 状态转换，返回是否生效
    async fn transition(
        &self,
        id: Uuid,
        from: &[PlaybookStatus],
        to: PlaybookStatus,
        actor: Option<Uuid>,
    ) -> Result<bool>;

    /// 只有 EXECUTING 状态的剧本会被写入终态
    async fn record_execution(&self, id: Uuid, record: &PlaybookExecutionRecord) -> Result<bool>;

    async fn list_auto_approvable_pending(&self, tenant_id: Uuid) -> Result<Vec<Playbook>>;
}

#[async_trait]
pub trait AuditLogStore: Send + Sync {
    async fn insert_entry(&self, entry: &AuditLogEntry) -> Result<()>;

    async fn get_entry(&self, id: Uuid) -> Result<Option<AuditLogEntry>>;

    /// 剧本执行产生的主条目（不含单动作撤销的子条目）
    async fn find_by_playbook(&self, playbook_id: Uuid) -> Result<Option<AuditLogEntry>>;

    /// 写回撤销流程修改的字段
    async fn update_entry(&self, entry: &AuditLogEntry) -> Result<()>;
}

/// 归档记录的状态转换及随之写入的字段
#[derive(Debug, Clone)]
pub enum ArchiveTransition {
    Archived {
        storage_key: String,
        storage_url: Option<String>,
        content_sha256: String,
        size_bytes: i64,
        mime_type: Option<String>,
        archived_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    },
    Restored {
        at: DateTime<Utc>,
        location: Option<String>,
    },
    Deleted {
        at: DateTime<Utc>,
    },
}

impl ArchiveTransition {
    pub fn target_status(&self) -> ArchiveStatus {
        match self {
            ArchiveTransition::Archived { .. } => ArchiveStatus::Archived,
            ArchiveTransition::Restored { .. } => ArchiveStatus::Restored,
            ArchiveTransition::Deleted { .. } => ArchiveStatus::Deleted,
        }
    }
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    async fn insert_archive(&self, file: &ArchivedFile) -> Result<()>;

    async fn get_archive(&self, id: Uuid) -> Result<Option<ArchivedFile>>;

    /// 同一源文件仍处于 STAGED / ARCHIVED 的记录
    async fn find_live_archive(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ArchivedFile>>;

    async fn transition_archive(
        &self,
        id: Uuid,
        from: &[ArchiveStatus],
        change: ArchiveTransition,
    ) -> Result<bool>;

    /// 迁移后改写存储位置
    async fn update_storage_location(&self, id: Uuid, key: &str, url: Option<&str>) -> Result<()>;

    /// ARCHIVED 且 expires_at <= now
    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ArchivedFile>>;

    /// ARCHIVED 且 now < expires_at <= now + days
    async fn list_expiring_within(&self, now: DateTime<Utc>, days: i64) -> Result<Vec<ArchivedFile>>;

    async fn record_warning(&self, id: Uuid, days: i32) -> Result<()>;

    /// 创建时间早于 before 仍为 STAGED
    async fn list_staged_before(&self, before: DateTime<Utc>) -> Result<Vec<ArchivedFile>>;

    async fn list_by_status(&self, tenant_id: Option<Uuid>, status: ArchiveStatus) -> Result<Vec<ArchivedFile>>;

    /// 每个租户 ARCHIVED 的总字节数
    async fn usage_by_tenant(&self) -> Result<Vec<TenantArchiveUsage>>;
}

#[async_trait]
pub trait JobRunStore: Send + Sync {
    /// 按幂等键开始一次尝试：新键插入；未完成的旧键尝试次数 +1；已完成的原样返回
    async fn begin_run(&self, key: &str, event_name: &str, tenant_id: Option<Uuid>) -> Result<JobRun>;

    async fn complete_step(&self, run_id: Uuid, step: &str, output: &serde_json::Value) -> Result<()>;

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        outcome: Option<&JobOutcome>,
        error: Option<&str>,
    ) -> Result<()>;

    async fn list_failed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRun>>;
}

/// 注入到各服务的存储集合
#[derive(Clone)]
pub struct Stores {
    pub tenants: Arc<dyn TenantDirectory>,
    pub integrations: Arc<dyn IntegrationStore>,
    pub audits: Arc<dyn AuditStore>,
    pub playbooks: Arc<dyn PlaybookStore>,
    pub audit_logs: Arc<dyn AuditLogStore>,
    pub archives: Arc<dyn ArchiveStore>,
    pub job_runs: Arc<dyn JobRunStore>,
}

impl Stores {
    pub fn postgres(db: PgPool) -> Self {
        Self {
            tenants: Arc::new(PgTenantDirectory::new(db.clone())),
            integrations: Arc::new(PgIntegrationStore::new(db.clone())),
            audits: Arc::new(PgAuditStore::new(db.clone())),
            playbooks: Arc::new(PgPlaybookStore::new(db.clone())),
            audit_logs: Arc::new(PgAuditLogStore::new(db.clone())),
            archives: Arc::new(PgArchiveStore::new(db.clone())),
            job_runs: Arc::new(PgJobRunStore::new(db)),
        }
    }

    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            tenants: store.clone(),
            integrations: store.clone(),
            audits: store.clone(),
            playbooks: store.clone(),
            audit_logs: store.clone(),
            archives: store.clone(),
            job_runs: store,
        }
    }
}
