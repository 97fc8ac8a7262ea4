//! In-memory store
//!
//! 与 Postgres 实现语义一致（compare-and-set、唯一约束），用于测试与本地演练

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    ArchiveStore, ArchiveTransition, AuditBundle, AuditLogStore, AuditStore, IntegrationStore,
    JobRunStore, PlaybookExecutionRecord, PlaybookStore, TenantDirectory,
};
use crate::error::{AppError, Result};
use crate::models::archive::{ArchiveStatus, ArchivedFile, TenantArchiveUsage};
use crate::models::audit::{AuditResult, FileRecord};
use crate::models::integration::{ConnectorConfig, Integration, Platform, SyncStatus};
use crate::models::jobs::{JobOutcome, JobRun, JobRunStatus};
use crate::models::playbook::{Playbook, PlaybookItem, PlaybookStatus};
use crate::models::tenant::Tenant;
use crate::models::undo::AuditLogEntry;

#[derive(Default)]
struct Tables {
    tenants: HashMap<Uuid, Tenant>,
    integrations: HashMap<Uuid, Integration>,
    audit_results: HashMap<Uuid, AuditResult>,
    file_records: HashMap<Uuid, Vec<FileRecord>>,
    playbooks: HashMap<Uuid, Playbook>,
    /// 按插入顺序保存
    items: Vec<PlaybookItem>,
    entries: HashMap<Uuid, AuditLogEntry>,
    archives: HashMap<Uuid, ArchivedFile>,
    job_runs: HashMap<String, JobRun>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_tenant(&self, tenant: Tenant) {
        self.tables.write().await.tenants.insert(tenant.id, tenant);
    }

    pub async fn insert_integration(&self, integration: Integration) {
        self.tables
            .write()
            .await
            .integrations
            .insert(integration.id, integration);
    }

    /// 直接写入剧本及条目（跳过审计流程）
    pub async fn insert_playbook(&self, playbook: Playbook, items: Vec<PlaybookItem>) {
        let mut tables = self.tables.write().await;
        tables.playbooks.insert(playbook.id, playbook);
        tables.items.extend(items);
    }

    pub async fn playbooks_for_tenant(&self, tenant_id: Uuid) -> Vec<Playbook> {
        let tables = self.tables.read().await;
        let mut playbooks: Vec<Playbook> = tables
            .playbooks
            .values()
            .filter(|p| p.tenant_id == tenant_id)
            .cloned()
            .collect();
        playbooks.sort_by_key(|p| p.created_at);
        playbooks
    }

    pub async fn audit_results_for_tenant(&self, tenant_id: Uuid) -> Vec<AuditResult> {
        let tables = self.tables.read().await;
        tables
            .audit_results
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn entries_for_tenant(&self, tenant_id: Uuid) -> Vec<AuditLogEntry> {
        let tables = self.tables.read().await;
        let mut entries: Vec<AuditLogEntry> = tables
            .entries
            .values()
            .filter(|e| e.tenant_id == tenant_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    pub async fn archives_for_tenant(&self, tenant_id: Uuid) -> Vec<ArchivedFile> {
        let tables = self.tables.read().await;
        tables
            .archives
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .cloned()
            .collect()
    }

    pub async fn job_run(&self, key: &str) -> Option<JobRun> {
        self.tables.read().await.job_runs.get(key).cloned()
    }
}

#[async_trait]
impl TenantDirectory for MemoryStore {
    async fn get_tenant(&self, id: Uuid) -> Result<Option<Tenant>> {
        Ok(self.tables.read().await.tenants.get(&id).cloned())
    }

    async fn list_tenants_with_plans(&self, plans: &[String]) -> Result<Vec<Tenant>> {
        let tables = self.tables.read().await;
        let mut tenants: Vec<Tenant> = tables
            .tenants
            .values()
            .filter(|t| t.plan_allowed(plans))
            .cloned()
            .collect();
        tenants.sort_by_key(|t| t.created_at);
        Ok(tenants)
    }
}

#[async_trait]
impl IntegrationStore for MemoryStore {
    async fn get_integration(&self, id: Uuid) -> Result<Option<Integration>> {
        Ok(self.tables.read().await.integrations.get(&id).cloned())
    }

    async fn list_active_integrations(&self, tenant_id: Uuid) -> Result<Vec<Integration>> {
        let tables = self.tables.read().await;
        let mut integrations: Vec<Integration> = tables
            .integrations
            .values()
            .filter(|i| i.tenant_id == tenant_id && i.is_active)
            .cloned()
            .collect();
        integrations.sort_by_key(|i| i.platform.as_str());
        Ok(integrations)
    }

    async fn find_active_integration(
        &self,
        tenant_id: Uuid,
        platform: Platform,
    ) -> Result<Option<Integration>> {
        let tables = self.tables.read().await;
        Ok(tables
            .integrations
            .values()
            .find(|i| i.tenant_id == tenant_id && i.platform == platform && i.is_active)
            .cloned())
    }

    async fn set_sync_status(
        &self,
        id: Uuid,
        status: SyncStatus,
        error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(integration) = tables.integrations.get_mut(&id) {
            integration.sync_status = status;
            integration.updated_at = at;
            match status {
                SyncStatus::Syncing => {}
                SyncStatus::Idle => {
                    integration.last_synced_at = Some(at);
                    integration.last_error = None;
                    integration.last_error_at = None;
                }
                SyncStatus::Error => {
                    integration.last_error = error.map(|e| e.to_string());
                    integration.last_error_at = Some(at);
                }
            }
        }
        Ok(())
    }

    async fn update_credentials(&self, id: Uuid, credentials: &ConnectorConfig) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(integration) = tables.integrations.get_mut(&id) {
            integration.credentials = Json(credentials.clone());
            integration.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_errored_integrations(&self) -> Result<Vec<Integration>> {
        let tables = self.tables.read().await;
        Ok(tables
            .integrations
            .values()
            .filter(|i| i.is_active && i.sync_status == SyncStatus::Error)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl AuditStore for MemoryStore {
    async fn persist_audit(&self, bundle: &AuditBundle) -> Result<()> {
        let mut tables = self.tables.write().await;
        if tables.audit_results.contains_key(&bundle.result.id) {
            return Err(AppError::Conflict(format!(
                "audit result {} already exists",
                bundle.result.id
            )));
        }

        tables
            .audit_results
            .insert(bundle.result.id, bundle.result.clone());
        tables
            .file_records
            .insert(bundle.result.id, bundle.files.clone());
        for draft in &bundle.playbooks {
            tables
                .playbooks
                .insert(draft.playbook.id, draft.playbook.clone());
            tables.items.extend(draft.items.iter().cloned());
        }
        Ok(())
    }

    async fn get_audit_result(&self, id: Uuid) -> Result<Option<AuditResult>> {
        Ok(self.tables.read().await.audit_results.get(&id).cloned())
    }

    async fn list_file_records(&self, audit_result_id: Uuid) -> Result<Vec<FileRecord>> {
        Ok(self
            .tables
            .read()
            .await
            .file_records
            .get(&audit_result_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_realized_savings(&self, id: Uuid, amount: f64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(result) = tables.audit_results.get_mut(&id) {
            result.realized_savings += amount;
        }
        Ok(())
    }
}

#[async_trait]
impl PlaybookStore for MemoryStore {
    async fn get_playbook(&self, id: Uuid) -> Result<Option<Playbook>> {
        Ok(self.tables.read().await.playbooks.get(&id).cloned())
    }

    async fn list_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .iter()
            .filter(|i| i.playbook_id == playbook_id)
            .cloned()
            .collect())
    }

    async fn list_selected_items(&self, playbook_id: Uuid) -> Result<Vec<PlaybookItem>> {
        let tables = self.tables.read().await;
        Ok(tables
            .items
            .iter()
            .filter(|i| i.playbook_id == playbook_id && i.is_selected)
            .cloned()
            .collect())
    }

    async fn set_item_selected(&self, playbook_id: Uuid, item_id: Uuid, selected: bool) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables
            .items
            .iter_mut()
            .find(|i| i.id == item_id && i.playbook_id == playbook_id)
        {
            Some(item) => {
                item.is_selected = selected;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[PlaybookStatus],
        to: PlaybookStatus,
        actor: Option<Uuid>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.playbooks.get_mut(&id) {
            Some(playbook) if from.contains(&playbook.status) => {
                playbook.status = to;
                if to == PlaybookStatus::Approved {
                    playbook.approved_by = actor;
                }
                playbook.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_execution(&self, id: Uuid, record: &PlaybookExecutionRecord) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.playbooks.get_mut(&id) {
            Some(playbook) if playbook.status == PlaybookStatus::Executing => {
                playbook.status = record.status;
                playbook.processed_count = record.processed;
                playbook.failed_count = record.failed;
                playbook.execution_duration_ms = Some(record.duration_ms);
                playbook.executed_by = Some(record.executed_by);
                playbook.executed_at = Some(record.executed_at);
                playbook.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list_auto_approvable_pending(&self, tenant_id: Uuid) -> Result<Vec<Playbook>> {
        let tables = self.tables.read().await;
        let mut playbooks: Vec<Playbook> = tables
            .playbooks
            .values()
            .filter(|p| {
                p.tenant_id == tenant_id && p.status == PlaybookStatus::Pending && p.auto_approvable
            })
            .cloned()
            .collect();
        playbooks.sort_by_key(|p| p.created_at);
        Ok(playbooks)
    }
}

#[async_trait]
impl AuditLogStore for MemoryStore {
    async fn insert_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        if entry.parent_entry_id.is_none() {
            if let Some(playbook_id) = entry.playbook_id {
                let exists = tables
                    .entries
                    .values()
                    .any(|e| e.playbook_id == Some(playbook_id) && e.parent_entry_id.is_none());
                if exists {
                    return Err(AppError::Conflict(format!(
                        "playbook {} already has an audit log entry",
                        playbook_id
                    )));
                }
            }
        }
        tables.entries.insert(entry.id, entry.clone());
        Ok(())
    }

    async fn get_entry(&self, id: Uuid) -> Result<Option<AuditLogEntry>> {
        Ok(self.tables.read().await.entries.get(&id).cloned())
    }

    async fn find_by_playbook(&self, playbook_id: Uuid) -> Result<Option<AuditLogEntry>> {
        let tables = self.tables.read().await;
        Ok(tables
            .entries
            .values()
            .find(|e| e.playbook_id == Some(playbook_id) && e.parent_entry_id.is_none())
            .cloned())
    }

    async fn update_entry(&self, entry: &AuditLogEntry) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.entries.get_mut(&entry.id) {
            existing.status = entry.status;
            existing.processed = entry.processed;
            existing.failed = entry.failed;
            existing.undo_actions = entry.undo_actions.clone();
            existing.errors = entry.errors.clone();
            existing.partial_undo = entry.partial_undo;
            existing.undone_at = entry.undone_at;
            existing.undone_by = entry.undone_by;
        }
        Ok(())
    }
}

fn is_live(status: ArchiveStatus) -> bool {
    matches!(status, ArchiveStatus::Staged | ArchiveStatus::Archived)
}

#[async_trait]
impl ArchiveStore for MemoryStore {
    async fn insert_archive(&self, file: &ArchivedFile) -> Result<()> {
        let mut tables = self.tables.write().await;
        let duplicate = tables.archives.values().any(|a| {
            a.tenant_id == file.tenant_id
                && a.platform == file.platform
                && a.external_id == file.external_id
                && is_live(a.status)
        });
        if duplicate && is_live(file.status) {
            return Err(AppError::Conflict(format!(
                "{} is already archived",
                file.external_id
            )));
        }
        tables.archives.insert(file.id, file.clone());
        Ok(())
    }

    async fn get_archive(&self, id: Uuid) -> Result<Option<ArchivedFile>> {
        Ok(self.tables.read().await.archives.get(&id).cloned())
    }

    async fn find_live_archive(
        &self,
        tenant_id: Uuid,
        platform: Platform,
        external_id: &str,
    ) -> Result<Option<ArchivedFile>> {
        let tables = self.tables.read().await;
        Ok(tables
            .archives
            .values()
            .find(|a| {
                a.tenant_id == tenant_id
                    && a.platform == platform
                    && a.external_id == external_id
                    && is_live(a.status)
            })
            .cloned())
    }

    async fn transition_archive(
        &self,
        id: Uuid,
        from: &[ArchiveStatus],
        change: ArchiveTransition,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let file = match tables.archives.get_mut(&id) {
            Some(file) if from.contains(&file.status) => file,
            _ => return Ok(false),
        };

        file.status = change.target_status();
        file.updated_at = Utc::now();
        match change {
            ArchiveTransition::Archived {
                storage_key,
                storage_url,
                content_sha256,
                size_bytes,
                mime_type,
                archived_at,
                expires_at,
            } => {
                file.archived_at = archived_at;
                file.expires_at = expires_at;
                file.storage_key = storage_key;
                file.storage_url = storage_url;
                file.content_sha256 = Some(content_sha256);
                file.size_bytes = size_bytes;
                if mime_type.is_some() {
                    file.mime_type = mime_type;
                }
            }
            ArchiveTransition::Restored { at, location } => {
                file.restored_at = Some(at);
                file.restored_location = location;
            }
            ArchiveTransition::Deleted { at } => {
                file.deleted_at = Some(at);
            }
        }
        Ok(true)
    }

    async fn update_storage_location(&self, id: Uuid, key: &str, url: Option<&str>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(file) = tables.archives.get_mut(&id) {
            file.storage_key = key.to_string();
            file.storage_url = url.map(|u| u.to_string());
            file.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ArchivedFile>> {
        let tables = self.tables.read().await;
        let mut files: Vec<ArchivedFile> = tables
            .archives
            .values()
            .filter(|a| a.status == ArchiveStatus::Archived && a.expires_at <= now)
            .cloned()
            .collect();
        files.sort_by_key(|a| a.expires_at);
        files.truncate(limit.max(0) as usize);
        Ok(files)
    }

    async fn list_expiring_within(&self, now: DateTime<Utc>, days: i64) -> Result<Vec<ArchivedFile>> {
        let horizon = now + Duration::days(days);
        let tables = self.tables.read().await;
        let mut files: Vec<ArchivedFile> = tables
            .archives
            .values()
            .filter(|a| {
                a.status == ArchiveStatus::Archived && a.expires_at > now && a.expires_at <= horizon
            })
            .cloned()
            .collect();
        files.sort_by_key(|a| a.expires_at);
        Ok(files)
    }

    async fn record_warning(&self, id: Uuid, days: i32) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(file) = tables.archives.get_mut(&id) {
            file.last_warning_days = Some(days);
        }
        Ok(())
    }

    async fn list_staged_before(&self, before: DateTime<Utc>) -> Result<Vec<ArchivedFile>> {
        let tables = self.tables.read().await;
        Ok(tables
            .archives
            .values()
            .filter(|a| a.status == ArchiveStatus::Staged && a.created_at < before)
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, tenant_id: Option<Uuid>, status: ArchiveStatus) -> Result<Vec<ArchivedFile>> {
        let tables = self.tables.read().await;
        let mut files: Vec<ArchivedFile> = tables
            .archives
            .values()
            .filter(|a| a.status == status && tenant_id.map_or(true, |t| a.tenant_id == t))
            .cloned()
            .collect();
        files.sort_by(|a, b| b.archived_at.cmp(&a.archived_at));
        Ok(files)
    }

    async fn usage_by_tenant(&self) -> Result<Vec<TenantArchiveUsage>> {
        let tables = self.tables.read().await;
        let mut usage: HashMap<Uuid, TenantArchiveUsage> = HashMap::new();
        for file in tables
            .archives
            .values()
            .filter(|a| a.status == ArchiveStatus::Archived)
        {
            let entry = usage.entry(file.tenant_id).or_insert(TenantArchiveUsage {
                tenant_id: file.tenant_id,
                archived_bytes: 0,
                archive_count: 0,
            });
            entry.archived_bytes += file.size_bytes;
            entry.archive_count += 1;
        }
        let mut usage: Vec<TenantArchiveUsage> = usage.into_values().collect();
        usage.sort_by(|a, b| b.archived_bytes.cmp(&a.archived_bytes));
        Ok(usage)
    }
}

#[async_trait]
impl JobRunStore for MemoryStore {
    async fn begin_run(&self, key: &str, event_name: &str, tenant_id: Option<Uuid>) -> Result<JobRun> {
        let mut tables = self.tables.write().await;
        let now = Utc::now();
        let run = tables
            .job_runs
            .entry(key.to_string())
            .and_modify(|run| {
                if run.status != JobRunStatus::Completed {
                    run.attempts += 1;
                    run.status = JobRunStatus::Running;
                    run.updated_at = now;
                }
            })
            .or_insert_with(|| JobRun {
                id: Uuid::new_v4(),
                job_key: key.to_string(),
                event_name: event_name.to_string(),
                tenant_id,
                status: JobRunStatus::Running,
                attempts: 1,
                completed_steps: Json(serde_json::Map::new()),
                outcome: None,
                last_error: None,
                created_at: now,
                updated_at: now,
            });
        Ok(run.clone())
    }

    async fn complete_step(&self, run_id: Uuid, step: &str, output: &serde_json::Value) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(run) = tables.job_runs.values_mut().find(|r| r.id == run_id) {
            run.completed_steps.0.insert(step.to_string(), output.clone());
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn finish_run(
        &self,
        run_id: Uuid,
        status: JobRunStatus,
        outcome: Option<&JobOutcome>,
        error: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(run) = tables.job_runs.values_mut().find(|r| r.id == run_id) {
            run.status = status;
            run.outcome = outcome.cloned().map(Json);
            run.last_error = error.map(|e| e.to_string());
            run.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn list_failed_since(&self, since: DateTime<Utc>) -> Result<Vec<JobRun>> {
        let tables = self.tables.read().await;
        Ok(tables
            .job_runs
            .values()
            .filter(|r| r.status == JobRunStatus::Failed && r.updated_at >= since)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::archive::OriginalLocation;

    fn archived(tenant_id: Uuid, external_id: &str, expires_at: DateTime<Utc>) -> ArchivedFile {
        let now = Utc::now();
        ArchivedFile {
            id: Uuid::new_v4(),
            tenant_id,
            platform: Platform::GoogleWorkspace,
            external_id: external_id.to_string(),
            file_name: format!("{}.pdf", external_id),
            mime_type: None,
            size_bytes: 10,
            content_sha256: None,
            storage_key: format!("{}/google_workspace/{}", tenant_id, external_id),
            storage_url: None,
            status: ArchiveStatus::Archived,
            original_location: Json(OriginalLocation::default()),
            archived_by: None,
            archived_at: now,
            expires_at,
            last_warning_days: None,
            restored_at: None,
            restored_location: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_archive_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let file = archived(Uuid::new_v4(), "f1", Utc::now());
        store.insert_archive(&file).await.unwrap();

        let deleted = ArchiveTransition::Deleted { at: Utc::now() };
        assert!(store
            .transition_archive(file.id, &[ArchiveStatus::Archived], deleted.clone())
            .await
            .unwrap());
        assert!(!store
            .transition_archive(file.id, &[ArchiveStatus::Archived], deleted)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_second_live_archive_of_same_file_conflicts() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        store
            .insert_archive(&archived(tenant, "f1", Utc::now()))
            .await
            .unwrap();
        let err = store
            .insert_archive(&archived(tenant, "f1", Utc::now()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_begin_run_counts_attempts_until_completed() {
        let store = MemoryStore::new();
        let first = store.begin_run("k", "audit/run", None).await.unwrap();
        let second = store.begin_run("k", "audit/run", None).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);

        store
            .finish_run(second.id, JobRunStatus::Completed, None, None)
            .await
            .unwrap();
        let third = store.begin_run("k", "audit/run", None).await.unwrap();
        assert_eq!(third.attempts, 2);
        assert_eq!(third.status, JobRunStatus::Completed);
    }

    #[tokio::test]
    async fn test_expiry_window_queries() {
        let store = MemoryStore::new();
        let tenant = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_archive(&archived(tenant, "gone", now - Duration::hours(1)))
            .await
            .unwrap();
        store
            .insert_archive(&archived(tenant, "soon", now + Duration::days(3)))
            .await
            .unwrap();
        store
            .insert_archive(&archived(tenant, "later", now + Duration::days(20)))
            .await
            .unwrap();

        let expired = store.list_expired(now, 100).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].external_id, "gone");

        let expiring = store.list_expiring_within(now, 7).await.unwrap();
        assert_eq!(expiring.len(), 1);
        assert_eq!(expiring[0].external_id, "soon");
    }
}
