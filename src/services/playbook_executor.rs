//! 剧本执行器
//!
//! 按剧本影响类别逐条调用连接器：单条失败记录后继续；平台不支持该类操作时中止整批。
//! 每个成功的条目生成一条撤销动作，汇总写入一条审计日志。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::archive_service::{request_for_item, ArchiveService};
use super::token_refresh::TokenService;
use crate::connectors::{Connector, OperationError, RevokeOutcome};
use crate::error::{AppError, Result};
use crate::models::playbook::{
    ExecutionReport, ImpactCategory, ItemMetadata, Playbook, PlaybookItem, PlaybookStatus,
};
use crate::models::undo::{
    undo_deadline, ActionType, AuditLogEntry, ItemFailure, LogStatus, RestoreAccess,
    RestoreChannel, RestoreFile, RestoreLicense, RestorePermissions, RestoreUser, UndoAction,
    UndoMeta,
};
use crate::repository::{
    AuditLogStore, AuditStore, IntegrationStore, PlaybookExecutionRecord, PlaybookStore,
};
use sqlx::types::Json;

/// 执行方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// 用户审批后执行，生成撤销动作
    Manual,
    /// 自动化执行，不生成撤销动作
    Automated,
}

/// 影响类别对应的动作类型
pub fn action_type_for(impact: ImpactCategory) -> ActionType {
    match impact {
        ImpactCategory::Security => ActionType::RevokeAccess,
        ImpactCategory::Savings => ActionType::ArchiveFile,
        ImpactCategory::Efficiency => ActionType::ArchiveChannel,
    }
}

/// 单次执行的累计结果
#[derive(Default)]
struct Tally {
    processed: i32,
    failed: i32,
    undo_actions: Vec<UndoAction>,
    errors: Vec<ItemFailure>,
}

impl Tally {
    fn fail(&mut self, item: &PlaybookItem, error: String) {
        self.failed += 1;
        self.errors.push(ItemFailure {
            target_id: item.external_id.clone(),
            target_name: item.item_name.clone(),
            error,
        });
    }
}

pub struct PlaybookExecutor {
    playbooks: Arc<dyn PlaybookStore>,
    audit_logs: Arc<dyn AuditLogStore>,
    audits: Arc<dyn AuditStore>,
    integrations: Arc<dyn IntegrationStore>,
    tokens: TokenService,
    archives: Option<Arc<ArchiveService>>,
}

impl PlaybookExecutor {
    pub fn new(
        playbooks: Arc<dyn PlaybookStore>,
        audit_logs: Arc<dyn AuditLogStore>,
        audits: Arc<dyn AuditStore>,
        integrations: Arc<dyn IntegrationStore>,
        tokens: TokenService,
    ) -> Self {
        Self {
            playbooks,
            audit_logs,
            audits,
            integrations,
            tokens,
            archives: None,
        }
    }

    /// SAVINGS 剧本的文件在归档前先复制到归档存储
    pub fn with_archive_copy(mut self, archives: Arc<ArchiveService>) -> Self {
        self.archives = Some(archives);
        self
    }

    pub async fn execute(
        &self,
        playbook_id: Uuid,
        actor: Uuid,
        mode: ExecutionMode,
    ) -> Result<ExecutionReport> {
        self.execute_at(playbook_id, actor, mode, Utc::now()).await
    }

    #[instrument(skip(self), fields(playbook_id = %playbook_id, actor = %actor))]
    pub async fn execute_at(
        &self,
        playbook_id: Uuid,
        actor: Uuid,
        mode: ExecutionMode,
        now: DateTime<Utc>,
    ) -> Result<ExecutionReport> {
        let playbook = self
            .playbooks
            .get_playbook(playbook_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Playbook {}", playbook_id)))?;

        match playbook.status {
            PlaybookStatus::Dismissed => {
                return Err(AppError::Conflict(format!(
                    "Playbook {} was dismissed",
                    playbook_id
                )))
            }
            PlaybookStatus::Executed | PlaybookStatus::Failed => {
                debug!(status = %playbook.status, "Playbook already executed, skipping");
                let entry = self.audit_logs.find_by_playbook(playbook_id).await?;
                return Ok(ExecutionReport {
                    playbook_id,
                    audit_log_id: entry.map(|e| e.id),
                    status: playbook.status,
                    processed: playbook.processed_count,
                    failed: playbook.failed_count,
                    skipped: true,
                    duration_ms: playbook.execution_duration_ms.unwrap_or_default(),
                    message: Some("Playbook already executed".to_string()),
                });
            }
            PlaybookStatus::Executing => return self.resume(&playbook, actor, now).await,
            PlaybookStatus::Pending | PlaybookStatus::Approved => {}
        }

        let claimed = self
            .playbooks
            .transition(
                playbook_id,
                &[PlaybookStatus::Pending, PlaybookStatus::Approved],
                PlaybookStatus::Executing,
                None,
            )
            .await?;
        if !claimed {
            return Err(AppError::Conflict(format!(
                "Playbook {} is already being executed",
                playbook_id
            )));
        }

        let started = Instant::now();
        let items = self.playbooks.list_selected_items(playbook_id).await?;
        info!(items = items.len(), impact = ?playbook.impact, ?mode, "Executing playbook");

        let connector = self.resolve_connector(&playbook, now).await;
        let mut tally = Tally::default();
        let mut aborted: Option<OperationError> = None;

        match connector {
            Resolved::Missing => {
                warn!(
                    platform = %playbook.source,
                    "No active integration for playbook platform, treating items as no-ops"
                );
                tally.processed = items.len() as i32;
            }
            Resolved::Failed(message) => {
                for item in &items {
                    tally.fail(item, message.clone());
                }
            }
            Resolved::Ready(connector) => {
                for item in &items {
                    match self
                        .apply(&playbook, item, connector.as_ref(), actor, now)
                        .await
                    {
                        Ok(action) => {
                            tally.processed += 1;
                            if mode == ExecutionMode::Manual {
                                tally.undo_actions.push(action);
                            }
                        }
                        Err(ItemError::Abort(e)) => {
                            error!(item_id = %item.id, error = %e, "Platform cannot perform this playbook, aborting batch");
                            tally.fail(item, e.to_string());
                            aborted = Some(e);
                            break;
                        }
                        Err(ItemError::Failed(message)) => {
                            warn!(item_id = %item.id, error = %message, "Playbook item failed");
                            tally.fail(item, message);
                        }
                    }
                }
            }
        }

        if aborted.is_some() {
            tally.undo_actions.clear();
        }

        let duration_ms = started.elapsed().as_millis() as i64;
        let status = if aborted.is_some() {
            LogStatus::Failed
        } else {
            LogStatus::from_counts(tally.processed as usize, tally.failed as usize)
        };

        let entry = AuditLogEntry {
            id: Uuid::new_v4(),
            tenant_id: playbook.tenant_id,
            playbook_id: Some(playbook.id),
            parent_entry_id: None,
            action_type: action_type_for(playbook.impact),
            target: playbook.title.clone(),
            platform: playbook.source,
            executed_by: actor,
            status,
            processed: tally.processed,
            failed: tally.failed,
            undo_expires_at: (!tally.undo_actions.is_empty()).then(|| undo_deadline(now)),
            undo_actions: Json(tally.undo_actions),
            errors: Json(tally.errors),
            partial_undo: tally.processed > 0 && tally.failed > 0,
            undone_at: None,
            undone_by: None,
            created_at: now,
        };
        self.audit_logs.insert_entry(&entry).await?;

        let final_status = if aborted.is_none() && tally.failed == 0 {
            PlaybookStatus::Executed
        } else {
            PlaybookStatus::Failed
        };
        self.playbooks
            .record_execution(
                playbook.id,
                &PlaybookExecutionRecord {
                    status: final_status,
                    processed: tally.processed,
                    failed: tally.failed,
                    duration_ms,
                    executed_by: actor,
                    executed_at: now,
                },
            )
            .await?;

        metrics::counter!("playbook_items_processed_total", "outcome" => "success")
            .increment(tally.processed.max(0) as u64);
        metrics::counter!("playbook_items_processed_total", "outcome" => "failed")
            .increment(tally.failed.max(0) as u64);

        if let Some(e) = aborted {
            return Err(AppError::from(e));
        }

        self.realize_savings(&playbook, tally.processed, items.len()).await;

        info!(
            processed = tally.processed,
            failed = tally.failed,
            duration_ms,
            status = %final_status,
            "Playbook executed"
        );

        Ok(ExecutionReport {
            playbook_id,
            audit_log_id: Some(entry.id),
            status: final_status,
            processed: tally.processed,
            failed: tally.failed,
            skipped: false,
            duration_ms,
            message: None,
        })
    }

    /// EXECUTING 的剧本：日志已写入说明上一次在更新剧本前中断，补写终态
    async fn resume(&self, playbook: &Playbook, actor: Uuid, now: DateTime<Utc>) -> Result<ExecutionReport> {
        let Some(entry) = self.audit_logs.find_by_playbook(playbook.id).await? else {
            return Err(AppError::Conflict(format!(
                "Playbook {} is already being executed",
                playbook.id
            )));
        };

        let status = if entry.failed == 0 {
            PlaybookStatus::Executed
        } else {
            PlaybookStatus::Failed
        };
        self.playbooks
            .record_execution(
                playbook.id,
                &PlaybookExecutionRecord {
                    status,
                    processed: entry.processed,
                    failed: entry.failed,
                    duration_ms: 0,
                    executed_by: actor,
                    executed_at: now,
                },
            )
            .await?;
        info!(audit_log_id = %entry.id, status = %status, "Finalized interrupted playbook execution");

        Ok(ExecutionReport {
            playbook_id: playbook.id,
            audit_log_id: Some(entry.id),
            status,
            processed: entry.processed,
            failed: entry.failed,
            skipped: true,
            duration_ms: 0,
            message: Some("Recovered interrupted execution".to_string()),
        })
    }

    async fn resolve_connector(&self, playbook: &Playbook, now: DateTime<Utc>) -> Resolved {
        let integration = match self
            .integrations
            .find_active_integration(playbook.tenant_id, playbook.source)
            .await
        {
            Ok(Some(integration)) => integration,
            Ok(None) => return Resolved::Missing,
            Err(e) => return Resolved::Failed(e.to_string()),
        };
        match self.tokens.connector_for(&integration, now).await {
            Ok(connector) => Resolved::Ready(connector),
            Err(e) => Resolved::Failed(e.to_string()),
        }
    }

    /// 已兑现节省 = 估算节省 × 成功条目 / 条目数
    async fn realize_savings(&self, playbook: &Playbook, processed: i32, total: usize) {
        let Some(audit_id) = playbook.audit_result_id else {
            return;
        };
        if processed <= 0 || total == 0 || playbook.estimated_savings <= 0.0 {
            return;
        }
        let amount = playbook.estimated_savings * processed as f64 / total as f64;
        if let Err(e) = self.audits.add_realized_savings(audit_id, amount).await {
            warn!(audit_id = %audit_id, error = %e, "Failed to record realized savings");
        }
    }

    async fn apply(
        &self,
        playbook: &Playbook,
        item: &PlaybookItem,
        connector: &dyn Connector,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> std::result::Result<UndoAction, ItemError> {
        let meta = UndoMeta {
            executed_at: now,
            executed_by: actor,
            original_metadata: item.metadata.0.clone(),
        };

        match playbook.impact {
            ImpactCategory::Security => {
                let outcome = connector.revoke_access(item).await.map_err(ItemError::from)?;
                Ok(revoke_undo_action(item, outcome, meta))
            }
            ImpactCategory::Savings => {
                let archive_id = self.copy_to_archive(playbook, item, connector, actor, now).await?;
                let location = match connector.archive_file(item).await {
                    Ok(location) => location,
                    Err(e) => {
                        // 源平台没有归档，副本不能留下
                        self.discard_archive_copy(archive_id, now).await;
                        return Err(ItemError::from(e));
                    }
                };
                let (original_path, original_parent_id) = match &item.metadata.0 {
                    ItemMetadata::File {
                        original_path,
                        parent_id,
                        ..
                    } => (original_path.clone(), parent_id.clone()),
                    _ => (String::new(), None),
                };
                Ok(UndoAction::RestoreFile(RestoreFile {
                    file_id: item.external_id.clone(),
                    file_name: item.item_name.clone(),
                    original_path,
                    original_parent_id,
                    archive_folder_id: location.archive_folder_id,
                    archive_id,
                    source: playbook.source,
                    meta,
                }))
            }
            ImpactCategory::Efficiency => {
                connector.archive_channel(item).await.map_err(ItemError::from)?;
                let (is_private, member_count) = match &item.metadata.0 {
                    ItemMetadata::Channel {
                        is_private,
                        member_count,
                        ..
                    } => (*is_private, *member_count),
                    _ => (false, 0),
                };
                Ok(UndoAction::RestoreChannel(RestoreChannel {
                    channel_id: item.external_id.clone(),
                    channel_name: item.item_name.clone(),
                    is_private,
                    member_count,
                    meta,
                }))
            }
        }
    }

    async fn discard_archive_copy(&self, archive_id: Option<Uuid>, now: DateTime<Utc>) {
        let (Some(archives), Some(id)) = (&self.archives, archive_id) else {
            return;
        };
        if let Err(e) = archives.cleanup_single_archive(id, now).await {
            warn!(archive_id = %id, error = %e, "Failed to discard archive copy");
        }
    }

    /// 复制文件到归档存储；平台不支持下载时跳过复制
    async fn copy_to_archive(
        &self,
        playbook: &Playbook,
        item: &PlaybookItem,
        connector: &dyn Connector,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> std::result::Result<Option<Uuid>, ItemError> {
        let Some(archives) = &self.archives else {
            return Ok(None);
        };
        let Some(request) = request_for_item(playbook.tenant_id, playbook.source, item, Some(actor))
        else {
            return Ok(None);
        };

        match archives.archive_at(&request, connector, now).await {
            Ok(archived) => Ok(Some(archived.id)),
            Err(e) if e.is_download_unsupported() => {
                debug!(item_id = %item.id, "Platform cannot download files, skipping archive copy");
                Ok(None)
            }
            Err(e) => Err(ItemError::Failed(format!("archive copy failed: {}", e))),
        }
    }
}

enum Resolved {
    Ready(Arc<dyn Connector>),
    Missing,
    Failed(String),
}

/// 单条执行失败：不支持的操作中止整批，其余只记录
enum ItemError {
    Abort(OperationError),
    Failed(String),
}

impl From<OperationError> for ItemError {
    fn from(e: OperationError) -> Self {
        if e.is_unsupported() {
            ItemError::Abort(e)
        } else {
            ItemError::Failed(e.to_string())
        }
    }
}

/// 撤销访问的结果转换为对应的撤销动作
fn revoke_undo_action(item: &PlaybookItem, outcome: RevokeOutcome, meta: UndoMeta) -> UndoAction {
    let user_email = match &item.metadata.0 {
        ItemMetadata::User { email, .. } => email.clone(),
        _ => None,
    };

    match outcome {
        RevokeOutcome::PermissionsRemoved { original_sharing } => {
            UndoAction::RestorePermissions(RestorePermissions {
                file_id: item.external_id.clone(),
                file_name: item.item_name.clone(),
                original_sharing,
                meta,
            })
        }
        RevokeOutcome::AccessRemoved {
            group_id,
            role,
            permissions,
        } => UndoAction::RestoreAccess(RestoreAccess {
            user_id: item.external_id.clone(),
            user_email,
            group_id,
            role,
            permissions,
            meta,
        }),
        RevokeOutcome::UserDeactivated { role, license_type } => {
            UndoAction::RestoreUser(RestoreUser {
                user_id: item.external_id.clone(),
                user_email,
                role,
                license_type,
                meta,
            })
        }
        RevokeOutcome::LicenseReleased { license_type } => {
            UndoAction::RestoreLicense(RestoreLicense {
                user_id: item.external_id.clone(),
                user_email,
                license_type,
                meta,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::playbook::ItemType;

    fn user_item() -> PlaybookItem {
        PlaybookItem {
            id: Uuid::new_v4(),
            playbook_id: Uuid::new_v4(),
            item_name: "Guest Person".to_string(),
            item_type: ItemType::User,
            external_id: "U42".to_string(),
            metadata: Json(ItemMetadata::User {
                email: Some("guest@example.com".to_string()),
                role: "guest".to_string(),
                license_type: None,
                group_id: Some("jira-users".to_string()),
                is_guest: true,
                last_active: None,
            }),
            is_selected: true,
            created_at: Utc::now(),
        }
    }

    fn meta(item: &PlaybookItem) -> UndoMeta {
        UndoMeta {
            executed_at: Utc::now(),
            executed_by: Uuid::new_v4(),
            original_metadata: item.metadata.0.clone(),
        }
    }

    #[test]
    fn test_impact_maps_to_action_type() {
        assert_eq!(action_type_for(ImpactCategory::Security), ActionType::RevokeAccess);
        assert_eq!(action_type_for(ImpactCategory::Savings), ActionType::ArchiveFile);
        assert_eq!(action_type_for(ImpactCategory::Efficiency), ActionType::ArchiveChannel);
    }

    #[test]
    fn test_access_removed_becomes_restore_access() {
        let item = user_item();
        let action = revoke_undo_action(
            &item,
            RevokeOutcome::AccessRemoved {
                group_id: Some("jira-users".to_string()),
                role: None,
                permissions: None,
            },
            meta(&item),
        );
        match action {
            UndoAction::RestoreAccess(a) => {
                assert_eq!(a.user_id, "U42");
                assert_eq!(a.user_email.as_deref(), Some("guest@example.com"));
                assert_eq!(a.group_id.as_deref(), Some("jira-users"));
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_deactivation_becomes_restore_user() {
        let item = user_item();
        let action = revoke_undo_action(
            &item,
            RevokeOutcome::UserDeactivated {
                role: "member".to_string(),
                license_type: Some("business".to_string()),
            },
            meta(&item),
        );
        assert_eq!(action.kind(), "restore_user");
        assert_eq!(action.target_id(), "U42");
    }

    #[test]
    fn test_unsupported_aborts_but_other_errors_do_not() {
        let abort: ItemError = OperationError::unsupported(
            crate::models::integration::Platform::Figma,
            crate::connectors::Operation::ArchiveFile,
        )
        .into();
        assert!(matches!(abort, ItemError::Abort(_)));

        let failed: ItemError = OperationError::InvalidTarget("bad id".to_string()).into();
        assert!(matches!(failed, ItemError::Failed(_)));
    }
}
