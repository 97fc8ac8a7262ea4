//! 撤销服务
//!
//! 在 30 天窗口内按动作类型回放撤销动作，逐条容错。

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::token_refresh::TokenService;
use crate::concurrency::{ConcurrencyStrategy, KeyedLocks};
use crate::connectors::{Connector, OpResult};
use crate::error::{AppError, Result};
use crate::models::undo::{
    ActionType, AuditLogEntry, ItemFailure, LogStatus, UndoAction, UndoReport,
};
use crate::repository::{AuditLogStore, IntegrationStore};
use sqlx::types::Json;

const ENTRY_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// 按动作类型调用对应的逆操作
pub async fn replay(connector: &dyn Connector, action: &UndoAction) -> OpResult<()> {
    match action {
        UndoAction::RestoreFile(a) => connector.restore_file(a).await,
        UndoAction::RestoreAccess(a) => connector.restore_access(a).await,
        UndoAction::RestorePermissions(a) => connector.restore_permissions(a).await,
        UndoAction::RestoreChannel(a) => connector.restore_channel(a).await,
        UndoAction::RestoreUser(a) => connector.restore_user(a).await,
        UndoAction::RestoreLicense(a) => connector.restore_license(a).await,
    }
}

fn failure_for(action: &UndoAction, error: String) -> ItemFailure {
    let target_name = match action {
        UndoAction::RestoreFile(a) => a.file_name.clone(),
        UndoAction::RestorePermissions(a) => a.file_name.clone(),
        UndoAction::RestoreChannel(a) => a.channel_name.clone(),
        UndoAction::RestoreAccess(a) => a.user_email.clone().unwrap_or_else(|| a.user_id.clone()),
        UndoAction::RestoreUser(a) => a.user_email.clone().unwrap_or_else(|| a.user_id.clone()),
        UndoAction::RestoreLicense(a) => a.user_email.clone().unwrap_or_else(|| a.user_id.clone()),
    };
    ItemFailure {
        target_id: action.target_id().to_string(),
        target_name,
        error,
    }
}

pub struct UndoService {
    audit_logs: Arc<dyn AuditLogStore>,
    integrations: Arc<dyn IntegrationStore>,
    tokens: TokenService,
    locks: KeyedLocks,
}

impl UndoService {
    pub fn new(
        audit_logs: Arc<dyn AuditLogStore>,
        integrations: Arc<dyn IntegrationStore>,
        tokens: TokenService,
    ) -> Self {
        Self {
            audit_logs,
            integrations,
            tokens,
            locks: KeyedLocks::new("audit_log_entry", ConcurrencyStrategy::Wait, ENTRY_LOCK_TIMEOUT),
        }
    }

    async fn load_undoable(&self, id: Uuid, now: DateTime<Utc>) -> Result<AuditLogEntry> {
        let entry = self
            .audit_logs
            .get_entry(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Audit log entry {}", id)))?;

        if entry.action_type == ActionType::UndoAction {
            return Err(AppError::BadRequest(
                "Undo records cannot themselves be undone".to_string(),
            ));
        }
        if entry.undo_actions.is_empty() {
            return Err(AppError::BadRequest(format!(
                "Audit log entry {} has nothing to undo",
                id
            )));
        }
        if !entry.undo_open_at(now) {
            return Err(AppError::Expired(format!(
                "Undo window for audit log entry {} has closed",
                id
            )));
        }
        Ok(entry)
    }

    /// 条目所在平台的连接器；取不到时返回失败原因
    async fn connector(
        &self,
        entry: &AuditLogEntry,
        now: DateTime<Utc>,
    ) -> std::result::Result<Arc<dyn Connector>, String> {
        let integration = self
            .integrations
            .find_active_integration(entry.tenant_id, entry.platform)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("No active {} integration", entry.platform))?;
        self.tokens
            .connector_for(&integration, now)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn undo_entry(&self, id: Uuid, actor: Uuid) -> Result<UndoReport> {
        self.undo_entry_at(id, actor, Utc::now()).await
    }

    /// 回放条目的全部撤销动作
    ///
    /// 失败的动作留在条目上可以再次尝试；全部成功后条目记为已撤销
    #[instrument(skip(self), fields(entry_id = %id, actor = %actor))]
    pub async fn undo_entry_at(&self, id: Uuid, actor: Uuid, now: DateTime<Utc>) -> Result<UndoReport> {
        let _permit = self.locks.acquire(&id.to_string()).await?;
        let mut entry = self.load_undoable(id, now).await?;

        let actions = std::mem::take(&mut entry.undo_actions.0);
        let mut remaining = Vec::new();
        let mut failures = Vec::new();
        let mut restored = 0i32;

        match self.connector(&entry, now).await {
            Ok(connector) => {
                for action in actions {
                    match replay(connector.as_ref(), &action).await {
                        Ok(()) => restored += 1,
                        Err(e) => {
                            warn!(kind = action.kind(), target = action.target_id(), error = %e, "Undo action failed");
                            failures.push(failure_for(&action, e.to_string()));
                            remaining.push(action);
                        }
                    }
                }
            }
            Err(message) => {
                warn!(error = %message, "Cannot resolve connector for undo");
                for action in actions {
                    failures.push(failure_for(&action, message.clone()));
                    remaining.push(action);
                }
            }
        }

        let failed = failures.len() as i32;
        entry.status = LogStatus::from_counts(restored as usize, failed as usize);
        entry.partial_undo = restored > 0 && failed > 0;
        entry.undo_actions = Json(remaining);
        entry.errors.0.extend(failures.iter().cloned());
        if failed == 0 {
            entry.undone_at = Some(now);
            entry.undone_by = Some(actor);
        }
        self.audit_logs.update_entry(&entry).await?;

        info!(restored, failed, "Undo finished");
        Ok(UndoReport {
            entry_id: entry.id,
            status: entry.status,
            restored,
            failed,
            partial_undo: entry.partial_undo,
            errors: failures,
        })
    }

    pub async fn undo_action(&self, id: Uuid, index: usize, actor: Uuid) -> Result<UndoReport> {
        self.undo_action_at(id, index, actor, Utc::now()).await
    }

    /// 只撤销一个动作，单独记一条子日志；成功后从父条目移除该动作
    #[instrument(skip(self), fields(entry_id = %id, index, actor = %actor))]
    pub async fn undo_action_at(
        &self,
        id: Uuid,
        index: usize,
        actor: Uuid,
        now: DateTime<Utc>,
    ) -> Result<UndoReport> {
        let _permit = self.locks.acquire(&id.to_string()).await?;
        let mut parent = self.load_undoable(id, now).await?;

        let action = parent.undo_actions.get(index).cloned().ok_or_else(|| {
            AppError::BadRequest(format!(
                "Undo action index {} out of range ({} actions)",
                index,
                parent.undo_actions.len()
            ))
        })?;

        let result = match self.connector(&parent, now).await {
            Ok(connector) => replay(connector.as_ref(), &action)
                .await
                .map_err(|e| e.to_string()),
            Err(message) => Err(message),
        };

        let (restored, errors) = match &result {
            Ok(()) => (1, vec![]),
            Err(message) => {
                warn!(kind = action.kind(), error = %message, "Single undo action failed");
                (0, vec![failure_for(&action, message.clone())])
            }
        };
        let failed = errors.len() as i32;

        let child = AuditLogEntry {
            id: Uuid::new_v4(),
            tenant_id: parent.tenant_id,
            playbook_id: parent.playbook_id,
            parent_entry_id: Some(parent.id),
            action_type: ActionType::UndoAction,
            target: action.target_id().to_string(),
            platform: parent.platform,
            executed_by: actor,
            status: LogStatus::from_counts(restored as usize, failed as usize),
            processed: restored,
            failed,
            undo_actions: Json(vec![]),
            errors: Json(errors.clone()),
            undo_expires_at: None,
            partial_undo: false,
            undone_at: None,
            undone_by: None,
            created_at: now,
        };
        self.audit_logs.insert_entry(&child).await?;

        if result.is_ok() {
            parent.undo_actions.0.remove(index);
            if parent.undo_actions.is_empty() {
                parent.undone_at = Some(now);
                parent.undone_by = Some(actor);
            }
            self.audit_logs.update_entry(&parent).await?;
        }

        info!(child_entry_id = %child.id, restored, failed, "Single undo finished");
        Ok(UndoReport {
            entry_id: child.id,
            status: child.status,
            restored,
            failed,
            partial_undo: false,
            errors,
        })
    }
}
