//! 审计汇总
//!
//! 并发拉取租户所有有效集成的审计数据（互不影响，单个平台失败只记录到该集成），
//! 合并后评分、生成剧本，并在一个事务里落库。

use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::playbook_generator::PlaybookGenerator;
use super::scoring::{score_audit, ScoringPolicy};
use super::token_refresh::TokenService;
use crate::error::{AppError, Result};
use crate::models::audit::{AuditData, AuditResult, FileRecord, UserRecord};
use crate::models::integration::{Integration, Platform, SyncStatus};
use crate::repository::{AuditBundle, AuditStore, IntegrationStore};
use sqlx::types::Json;

/// 单个集成的同步失败
#[derive(Debug, Clone, PartialEq)]
pub struct SyncFailure {
    pub integration_id: Uuid,
    pub platform: Platform,
    pub error: String,
}

/// 一次同步的结果
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub data: HashMap<Platform, AuditData>,
    pub errors: Vec<SyncFailure>,
}

impl SyncOutcome {
    pub fn succeeded(&self) -> usize {
        self.data.len()
    }
}

pub struct AuditAggregator {
    integrations: Arc<dyn IntegrationStore>,
    audits: Arc<dyn AuditStore>,
    tokens: TokenService,
    scoring: ScoringPolicy,
    generator: PlaybookGenerator,
}

impl AuditAggregator {
    pub fn new(
        integrations: Arc<dyn IntegrationStore>,
        audits: Arc<dyn AuditStore>,
        tokens: TokenService,
        scoring: ScoringPolicy,
        generator: PlaybookGenerator,
    ) -> Self {
        Self {
            integrations,
            audits,
            tokens,
            scoring,
            generator,
        }
    }

    /// 同步单个集成：SYNCING → IDLE | ERROR
    async fn sync_one(&self, integration: &Integration) -> std::result::Result<AuditData, String> {
        let now = Utc::now();
        if let Err(e) = self
            .integrations
            .set_sync_status(integration.id, SyncStatus::Syncing, None, now)
            .await
        {
            warn!(integration_id = %integration.id, error = %e, "Failed to mark integration as syncing");
        }

        let fetched = match self.tokens.connector_for(integration, now).await {
            Ok(connector) => connector.fetch_audit_data().await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        let (status, error) = match &fetched {
            Ok(_) => (SyncStatus::Idle, None),
            Err(e) => (SyncStatus::Error, Some(e.as_str())),
        };
        if let Err(e) = self
            .integrations
            .set_sync_status(integration.id, status, error, Utc::now())
            .await
        {
            warn!(integration_id = %integration.id, error = %e, "Failed to record sync status");
        }

        metrics::counter!(
            "connector_requests_total",
            "platform" => integration.platform.as_str(),
            "outcome" => if fetched.is_ok() { "success" } else { "error" }
        )
        .increment(1);

        fetched
    }

    /// 同步租户的全部有效集成（可按平台过滤）
    ///
    /// 所有集成并发执行，一个平台失败不会取消其他平台
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn sync_all_integrations(
        &self,
        tenant_id: Uuid,
        source: Option<Platform>,
    ) -> Result<SyncOutcome> {
        let integrations: Vec<Integration> = self
            .integrations
            .list_active_integrations(tenant_id)
            .await?
            .into_iter()
            .filter(|i| source.map_or(true, |p| i.platform == p))
            .collect();

        let results = join_all(integrations.iter().map(|i| self.sync_one(i))).await;

        let mut outcome = SyncOutcome::default();
        for (integration, result) in integrations.iter().zip(results) {
            match result {
                Ok(data) => {
                    let entry = outcome.data.entry(integration.platform).or_default();
                    merge_into(entry, data);
                }
                Err(e) => {
                    warn!(
                        integration_id = %integration.id,
                        platform = %integration.platform,
                        error = %e,
                        "Integration sync failed"
                    );
                    outcome.errors.push(SyncFailure {
                        integration_id: integration.id,
                        platform: integration.platform,
                        error: e,
                    });
                }
            }
        }

        info!(
            succeeded = outcome.succeeded(),
            failed = outcome.errors.len(),
            "Integration sync finished"
        );
        Ok(outcome)
    }

    pub async fn run_audit(&self, tenant_id: Uuid, triggered_by: Option<Uuid>) -> Result<AuditResult> {
        self.run_audit_at(tenant_id, triggered_by, Utc::now()).await
    }

    /// 同步 → 评分 → 生成剧本 → 原子落库
    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    pub async fn run_audit_at(
        &self,
        tenant_id: Uuid,
        triggered_by: Option<Uuid>,
        now: DateTime<Utc>,
    ) -> Result<AuditResult> {
        let outcome = self.sync_all_integrations(tenant_id, None).await?;

        if outcome.data.is_empty() {
            if outcome.errors.is_empty() {
                return Err(AppError::Validation(
                    "Tenant has no active integrations to audit".to_string(),
                ));
            }
            error!(failed = outcome.errors.len(), "Every integration failed to sync");
            return Err(AppError::Connector(format!(
                "All {} integrations failed to sync",
                outcome.errors.len()
            )));
        }

        let mut platforms: Vec<Platform> = outcome.data.keys().copied().collect();
        platforms.sort_by_key(|p| p.as_str());

        let (files, users) = flatten(&outcome.data, &platforms);
        let card = score_audit(&files, &users, now, &self.scoring);

        let audit_id = Uuid::new_v4();
        let mut playbooks = Vec::new();
        for platform in &platforms {
            if let Some(data) = outcome.data.get(platform) {
                playbooks.extend(
                    self.generator
                        .generate(tenant_id, Some(audit_id), *platform, data, now),
                );
            }
        }

        let result = AuditResult {
            id: audit_id,
            tenant_id,
            triggered_by,
            score: card.score,
            estimated_savings: card.estimated_savings,
            realized_savings: 0.0,
            waste: Json(card.waste),
            active_risks: card.risks.active_risks,
            critical_risks: card.risks.critical_risks,
            moderate_risks: card.risks.moderate_risks,
            platforms: Json(platforms),
            file_count: files.len() as i64,
            playbook_count: playbooks.len() as i64,
            created_at: now,
        };

        self.audits
            .persist_audit(&AuditBundle {
                result: result.clone(),
                files,
                playbooks,
            })
            .await?;

        info!(
            audit_id = %result.id,
            score = result.score,
            playbooks = result.playbook_count,
            "Audit completed"
        );
        Ok(result)
    }
}

/// 同一平台多个集成的数据合并
fn merge_into(target: &mut AuditData, data: AuditData) {
    target.files.extend(data.files);
    target.users.extend(data.users);
    if let Some(channels) = data.channels {
        target.channels.get_or_insert_with(Vec::new).extend(channels);
    }
    target.storage_used_gb += data.storage_used_gb;
    target.total_licenses += data.total_licenses;
    target.active_users += data.active_users;
}

/// 按平台顺序展开成扁平列表
fn flatten(
    data: &HashMap<Platform, AuditData>,
    platforms: &[Platform],
) -> (Vec<FileRecord>, Vec<UserRecord>) {
    let mut files = Vec::new();
    let mut users = Vec::new();
    for platform in platforms {
        if let Some(d) = data.get(platform) {
            files.extend(d.files.iter().cloned());
            users.extend(d.users.iter().cloned());
        }
    }
    (files, users)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::ChannelRecord;

    #[test]
    fn test_merge_keeps_channels_optional() {
        let mut target = AuditData::default();
        merge_into(
            &mut target,
            AuditData {
                storage_used_gb: 1.5,
                total_licenses: 3,
                ..Default::default()
            },
        );
        assert!(target.channels.is_none());

        merge_into(
            &mut target,
            AuditData {
                channels: Some(vec![ChannelRecord {
                    external_id: "C1".to_string(),
                    name: "general".to_string(),
                    source: Platform::Slack,
                    is_private: false,
                    is_archived: false,
                    member_count: 10,
                    last_activity: None,
                }]),
                storage_used_gb: 0.5,
                total_licenses: 2,
                ..Default::default()
            },
        );
        assert_eq!(target.channels.as_ref().map(|c| c.len()), Some(1));
        assert!((target.storage_used_gb - 2.0).abs() < 1e-9);
        assert_eq!(target.total_licenses, 5);
    }
}
