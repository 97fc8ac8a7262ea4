//! 自动化执行
//!
//! 只处理套餐允许自动化的租户；同一租户同时只有一次自动运行，
//! 只自动审批满足资格的 PENDING 剧本。自动运行不产生撤销动作。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::playbook_executor::{ExecutionMode, PlaybookExecutor};
use super::playbook_generator::is_auto_approvable;
use crate::concurrency::{ConcurrencyError, ConcurrencyStrategy, KeyedLocks};
use crate::config::AutomationConfig;
use crate::error::Result;
use crate::models::playbook::PlaybookStatus;
use crate::models::tenant::Tenant;
use crate::repository::{PlaybookStore, TenantDirectory};

#[derive(Debug, Clone)]
pub struct AutomationPolicy {
    pub enabled: bool,
    pub allowed_plans: Vec<String>,
    pub max_items: usize,
}

impl AutomationPolicy {
    pub fn from_config(config: &AutomationConfig) -> Self {
        Self {
            enabled: config.enabled,
            allowed_plans: config.allowed_plans.clone(),
            max_items: config.max_items.max(0) as usize,
        }
    }
}

/// 单个租户的自动运行结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantAutomationReport {
    pub tenant_id: Uuid,
    pub executed: i64,
    pub failed: i64,
    pub skipped: i64,
    /// 另一轮自动运行正在处理该租户
    pub busy: bool,
}

/// 一轮自动运行的汇总
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutomationReport {
    pub tenants: Vec<TenantAutomationReport>,
}

impl AutomationReport {
    pub fn executed(&self) -> i64 {
        self.tenants.iter().map(|t| t.executed).sum()
    }

    pub fn failed(&self) -> i64 {
        self.tenants.iter().map(|t| t.failed).sum()
    }
}

pub struct AutomationService {
    tenants: Arc<dyn TenantDirectory>,
    playbooks: Arc<dyn PlaybookStore>,
    executor: Arc<PlaybookExecutor>,
    locks: KeyedLocks,
    policy: AutomationPolicy,
}

impl AutomationService {
    pub fn new(
        tenants: Arc<dyn TenantDirectory>,
        playbooks: Arc<dyn PlaybookStore>,
        executor: Arc<PlaybookExecutor>,
        policy: AutomationPolicy,
    ) -> Self {
        Self {
            tenants,
            playbooks,
            executor,
            locks: KeyedLocks::new("tenant", ConcurrencyStrategy::Reject, Duration::ZERO),
            policy,
        }
    }

    /// 对所有允许自动化的租户跑一轮
    #[instrument(skip(self))]
    pub async fn run_all(&self, now: DateTime<Utc>) -> Result<AutomationReport> {
        let mut report = AutomationReport::default();
        if !self.policy.enabled {
            debug!("Automation disabled, skipping run");
            return Ok(report);
        }

        let tenants = self
            .tenants
            .list_tenants_with_plans(&self.policy.allowed_plans)
            .await?;
        for tenant in tenants {
            match self.run_tenant(&tenant, now).await {
                Ok(r) => report.tenants.push(r),
                Err(e) => warn!(tenant_id = %tenant.id, error = %e, "Automation run failed for tenant"),
            }
        }

        info!(
            tenants = report.tenants.len(),
            executed = report.executed(),
            failed = report.failed(),
            "Automation run finished"
        );
        Ok(report)
    }

    #[instrument(skip(self, tenant), fields(tenant_id = %tenant.id))]
    pub async fn run_tenant(&self, tenant: &Tenant, now: DateTime<Utc>) -> Result<TenantAutomationReport> {
        let mut report = TenantAutomationReport {
            tenant_id: tenant.id,
            ..Default::default()
        };

        if !tenant.plan_allowed(&self.policy.allowed_plans) {
            debug!(plan = %tenant.plan, "Plan does not allow automation");
            return Ok(report);
        }

        let _permit = match self.locks.try_acquire(&tenant.id.to_string()) {
            Ok(permit) => permit,
            Err(ConcurrencyError::Rejected { .. }) => {
                info!("Automation already running for tenant, skipping");
                report.busy = true;
                return Ok(report);
            }
            Err(e) => return Err(e.into()),
        };

        let actor = tenant.automation_actor.unwrap_or_else(Uuid::nil);
        let candidates = self.playbooks.list_auto_approvable_pending(tenant.id).await?;

        for playbook in candidates {
            // 落库后条目选择可能被修改，按当前状态重新判定资格
            let items = self.playbooks.list_items(playbook.id).await?;
            let eligible = playbook.status == PlaybookStatus::Pending
                && is_auto_approvable(playbook.risk, playbook.impact, &items, self.policy.max_items);
            if !eligible {
                report.skipped += 1;
                continue;
            }

            let approved = self
                .playbooks
                .transition(
                    playbook.id,
                    &[PlaybookStatus::Pending],
                    PlaybookStatus::Approved,
                    Some(actor),
                )
                .await?;
            if !approved {
                report.skipped += 1;
                continue;
            }

            match self
                .executor
                .execute_at(playbook.id, actor, ExecutionMode::Automated, now)
                .await
            {
                Ok(result) if result.failed == 0 => report.executed += 1,
                Ok(_) => report.failed += 1,
                Err(e) => {
                    warn!(playbook_id = %playbook.id, error = %e, "Automated playbook execution failed");
                    report.failed += 1;
                }
            }
        }

        Ok(report)
    }
}
