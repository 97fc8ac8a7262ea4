//! 作业处理函数
//!
//! 每种事件一串具名步骤：校验 → 修改外部系统 → 落库 → 通知。

use chrono::{Duration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use super::runner::StepContext;
use super::JobError;
use crate::concurrency::FanOutLimiter;
use crate::error::{AppError, Result};
use crate::models::archive::ArchiveHealthReport;
use crate::models::jobs::{
    ArchiveBatchEvent, ArchiveFileEvent, AuditRunEvent, IntegrationsSyncEvent, JobEvent,
    JobOutcome, PlaybookExecuteEvent,
};
use crate::models::playbook::ExecutionReport;
use crate::repository::{IntegrationStore, JobRunStore};
use crate::services::archive_service::{ArchiveService, CleanupOutcome, MigrationReport};
use crate::services::automation::{AutomationReport, AutomationService};
use crate::services::blob_store::BlobStore;
use crate::services::{
    AuditAggregator, ExecutionMode, Notification, Notifier, PlaybookExecutor, TokenService,
};

/// 过期清理单次处理的上限
const SWEEP_BATCH_LIMIT: i64 = 500;

/// 失败监控回看的时间窗
const FAILURE_MONITOR_WINDOW_HOURS: i64 = 1;

/// 批量操作的汇总（同时作为步骤输出保存）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub processed: i64,
    pub failed: i64,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl BatchSummary {
    fn outcome(&self) -> JobOutcome {
        JobOutcome::ok(self.processed, self.failed).with_details(json!({ "errors": self.errors }))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SyncSummary {
    succeeded: i64,
    failed: i64,
    errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditSummary {
    audit_id: Uuid,
    score: i32,
    playbooks: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FailureScan {
    failed_jobs: Vec<String>,
    errored_integrations: Vec<Uuid>,
}

/// 作业处理函数需要的全部协作方
pub struct JobHandlers {
    pub aggregator: Arc<AuditAggregator>,
    pub executor: Arc<PlaybookExecutor>,
    pub archives: Arc<ArchiveService>,
    pub automation: Arc<AutomationService>,
    pub tokens: TokenService,
    pub integrations: Arc<dyn IntegrationStore>,
    pub job_runs: Arc<dyn JobRunStore>,
    pub notifier: Arc<dyn Notifier>,
    /// 存储迁移的来源
    pub legacy_blobs: Option<Arc<dyn BlobStore>>,
    pub warning_days: Vec<i64>,
    pub batch_concurrency: usize,
}

impl JobHandlers {
    /// 按事件分发
    pub async fn handle(&self, event: &JobEvent, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        match event {
            JobEvent::AuditRun(e) => self.audit_run(e, ctx).await,
            JobEvent::IntegrationsSync(e) => self.integrations_sync(e, ctx).await,
            JobEvent::PlaybookExecute(e) => self.playbook_execute(e, ctx).await,
            JobEvent::ArchiveFileCreated(e) | JobEvent::ArchiveFileRestored(e) => {
                info!(event = event.name(), archive_id = %e.archive_id, tenant_id = %e.tenant_id, "Archive lifecycle event");
                Ok(JobOutcome::ok(1, 0))
            }
            JobEvent::ArchiveFileExpiring(e) => self.file_expiring(e, ctx).await,
            JobEvent::ArchiveBatchRestore(e) => self.batch_restore(e, ctx).await,
            JobEvent::ArchiveBatchDelete(e) => self.batch_delete(e, ctx).await,
            JobEvent::ArchiveMigrateStorage(e) => self.migrate_storage(e, ctx).await,
            JobEvent::ArchiveExpiryWarn => self.expiry_warn(ctx).await,
            JobEvent::ArchiveExpirySweep => self.expiry_sweep(ctx).await,
            JobEvent::ArchiveHealthCheck => self.health_check(ctx).await,
            JobEvent::AutomationRun => self.automation_run(ctx).await,
            JobEvent::FailureMonitor => self.failure_monitor(ctx).await,
        }
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %e.tenant_id))]
    async fn audit_run(&self, e: &AuditRunEvent, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let summary: AuditSummary = ctx
            .step("run-audit", || async {
                let result = self.aggregator.run_audit(e.tenant_id, Some(e.user_id)).await?;
                Ok(AuditSummary {
                    audit_id: result.id,
                    score: result.score,
                    playbooks: result.playbook_count,
                })
            })
            .await?;

        Ok(JobOutcome::ok(1, 0).with_details(json!({
            "auditId": summary.audit_id,
            "score": summary.score,
            "playbooks": summary.playbooks,
        })))
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %e.tenant_id))]
    async fn integrations_sync(
        &self,
        e: &IntegrationsSyncEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        let summary: SyncSummary = ctx
            .step("sync", || async {
                let outcome = self.aggregator.sync_all_integrations(e.tenant_id, e.source).await?;
                Ok(SyncSummary {
                    succeeded: outcome.succeeded() as i64,
                    failed: outcome.errors.len() as i64,
                    errors: outcome
                        .errors
                        .iter()
                        .map(|f| format!("{}: {}", f.platform, f.error))
                        .collect(),
                })
            })
            .await?;

        Ok(JobOutcome::ok(summary.succeeded, summary.failed)
            .with_details(json!({ "errors": summary.errors })))
    }

    #[instrument(skip(self, ctx), fields(playbook_id = %e.playbook_id))]
    async fn playbook_execute(
        &self,
        e: &PlaybookExecuteEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        let report: ExecutionReport = ctx
            .step("execute", || async {
                self.executor
                    .execute(e.playbook_id, e.user_id, ExecutionMode::Manual)
                    .await
            })
            .await?;

        let mut outcome = JobOutcome::ok(report.processed as i64, report.failed as i64)
            .with_details(json!({
                "status": report.status,
                "auditLogId": report.audit_log_id,
                "durationMs": report.duration_ms,
            }));
        if let Some(message) = report.message {
            outcome = outcome.with_message(message);
        }
        Ok(outcome)
    }

    async fn file_expiring(
        &self,
        e: &ArchiveFileEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        ctx.step("notify", || async {
            let Some(expires_at) = e.expires_at else {
                return Ok(false);
            };
            self.notifier
                .notify(&Notification::ArchiveExpiring {
                    tenant_id: e.tenant_id,
                    archive_id: e.archive_id,
                    file_name: e.file_name.clone(),
                    days_remaining: e.days_remaining.unwrap_or_default(),
                    expires_at,
                })
                .await?;
            Ok(true)
        })
        .await?;
        Ok(JobOutcome::ok(1, 0))
    }

    /// 批量恢复（受限扇出）
    #[instrument(skip(self, ctx), fields(tenant_id = %e.tenant_id, count = e.archive_ids.len()))]
    async fn batch_restore(
        &self,
        e: &ArchiveBatchEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        let summary: BatchSummary = ctx
            .step("restore", || async {
                let limiter = FanOutLimiter::new(self.batch_concurrency);
                let results = join_all(e.archive_ids.iter().map(|id| {
                    let limiter = limiter.clone();
                    async move {
                        let _permit = limiter.acquire().await?;
                        self.restore_one(*id, e.tenant_id).await
                    }
                }))
                .await;
                Ok(summarize(&e.archive_ids, results))
            })
            .await?;
        Ok(summary.outcome())
    }

    async fn restore_one(&self, id: Uuid, tenant_id: Uuid) -> Result<()> {
        let now = Utc::now();
        let archive = self.archives.get(id).await?;
        if archive.tenant_id != tenant_id {
            return Err(AppError::NotFound(format!("Archive {}", id)));
        }
        let connector = self
            .tokens
            .connector_for_platform(tenant_id, archive.platform, now)
            .await?;
        self.archives
            .restore_via(id, None, connector.as_ref(), now)
            .await?;
        Ok(())
    }

    /// 批量删除（受限扇出）
    #[instrument(skip(self, ctx), fields(tenant_id = %e.tenant_id, count = e.archive_ids.len()))]
    async fn batch_delete(
        &self,
        e: &ArchiveBatchEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        let summary: BatchSummary = ctx
            .step("delete", || async {
                let limiter = FanOutLimiter::new(self.batch_concurrency);
                let results = join_all(e.archive_ids.iter().map(|id| {
                    let limiter = limiter.clone();
                    async move {
                        let _permit = limiter.acquire().await?;
                        let archive = self.archives.get(*id).await?;
                        if archive.tenant_id != e.tenant_id {
                            return Err(AppError::NotFound(format!("Archive {}", id)));
                        }
                        self.archives
                            .cleanup_single_archive(*id, Utc::now())
                            .await
                            .map(|_| ())
                            .map_err(AppError::from)
                    }
                }))
                .await;
                Ok(summarize(&e.archive_ids, results))
            })
            .await?;
        Ok(summary.outcome())
    }

    #[instrument(skip(self, ctx), fields(tenant_id = %e.tenant_id, count = e.archive_ids.len()))]
    async fn migrate_storage(
        &self,
        e: &ArchiveBatchEvent,
        ctx: &mut StepContext,
    ) -> std::result::Result<JobOutcome, JobError> {
        let Some(legacy) = self.legacy_blobs.clone() else {
            return Err(JobError::Permanent(
                "no legacy archive storage is configured".to_string(),
            ));
        };

        let report: MigrationReport = ctx
            .step("migrate", || async {
                Ok(self.archives.migrate_storage(&e.archive_ids, legacy.as_ref()).await?)
            })
            .await?;

        Ok(JobOutcome::ok(report.migrated, report.failed)
            .with_details(json!({ "skipped": report.skipped })))
    }

    /// 发送到期提醒；每个档位只发一次
    async fn send_warnings(&self) -> Result<BatchSummary> {
        let now = Utc::now();
        let due = self.archives.due_warnings(now, &self.warning_days).await?;
        let mut summary = BatchSummary::default();

        for (file, threshold) in due {
            let notified = self
                .notifier
                .notify(&Notification::ArchiveExpiring {
                    tenant_id: file.tenant_id,
                    archive_id: file.id,
                    file_name: file.file_name.clone(),
                    days_remaining: file.days_until_expiry(now),
                    expires_at: file.expires_at,
                })
                .await;
            let recorded = match notified {
                Ok(()) => self.archives.record_warning(file.id, threshold).await.map_err(AppError::from),
                Err(e) => Err(e),
            };
            match recorded {
                Ok(()) => summary.processed += 1,
                Err(e) => {
                    warn!(archive_id = %file.id, error = %e, "Failed to send expiry warning");
                    summary.failed += 1;
                    summary.errors.push(format!("{}: {}", file.id, e));
                }
            }
        }
        Ok(summary)
    }

    async fn expiry_warn(&self, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let summary: BatchSummary = ctx.step("warn", || self.send_warnings()).await?;
        Ok(summary.outcome())
    }

    /// 先提醒再删除，保证同一轮里提醒总在删除之前
    #[instrument(skip(self, ctx))]
    async fn expiry_sweep(&self, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let warned: BatchSummary = ctx.step("warn", || self.send_warnings()).await?;

        let swept: BatchSummary = ctx
            .step("sweep", || async {
                let expired = self.archives.expired(Utc::now(), SWEEP_BATCH_LIMIT).await?;
                let ids: Vec<Uuid> = expired.iter().map(|f| f.id).collect();
                let limiter = FanOutLimiter::new(self.batch_concurrency);
                let results = join_all(ids.iter().map(|id| {
                    let limiter = limiter.clone();
                    async move {
                        let _permit = limiter.acquire().await?;
                        match self.archives.cleanup_single_archive(*id, Utc::now()).await {
                            Ok(CleanupOutcome::Deleted) | Ok(CleanupOutcome::AlreadyDeleted) => Ok(()),
                            Err(e) => Err(AppError::from(e)),
                        }
                    }
                }))
                .await;
                Ok(summarize(&ids, results))
            })
            .await?;

        info!(warned = warned.processed, deleted = swept.processed, failed = swept.failed, "Expiry sweep finished");
        Ok(swept.outcome().with_details(json!({
            "warned": warned.processed,
            "errors": swept.errors,
        })))
    }

    async fn health_check(&self, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let report: ArchiveHealthReport = ctx
            .step("check", || async {
                Ok(self.archives.health_check(Utc::now()).await?)
            })
            .await?;

        let problems = (report.orphaned.len() + report.stuck_staged.len()) as i64;
        let mut outcome = JobOutcome::ok(report.checked as i64, problems).with_details(json!({
            "orphaned": report.orphaned,
            "stuckStaged": report.stuck_staged,
            "highUsageTenants": report.high_usage_tenants,
        }));
        if !report.is_healthy() {
            outcome = outcome.with_message("Archive storage needs attention");
        }
        Ok(outcome)
    }

    async fn automation_run(&self, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let report: AutomationReport = ctx
            .step("automation", || async { self.automation.run_all(Utc::now()).await })
            .await?;
        Ok(JobOutcome::ok(report.executed(), report.failed())
            .with_details(json!({ "tenants": report.tenants })))
    }

    async fn failure_monitor(&self, ctx: &mut StepContext) -> std::result::Result<JobOutcome, JobError> {
        let scan: FailureScan = ctx
            .step("scan", || async {
                let since = Utc::now() - Duration::hours(FAILURE_MONITOR_WINDOW_HOURS);
                let failed_jobs = self
                    .job_runs
                    .list_failed_since(since)
                    .await?
                    .into_iter()
                    .map(|r| r.job_key)
                    .collect();
                let errored_integrations = self
                    .integrations
                    .list_errored_integrations()
                    .await?
                    .into_iter()
                    .map(|i| i.id)
                    .collect();
                Ok(FailureScan {
                    failed_jobs,
                    errored_integrations,
                })
            })
            .await?;

        let found = (scan.failed_jobs.len() + scan.errored_integrations.len()) as i64;
        if found > 0 {
            ctx.step("notify", || async {
                self.notifier
                    .notify(&Notification::FailureDigest {
                        failed_jobs: scan.failed_jobs.clone(),
                        errored_integrations: scan.errored_integrations.clone(),
                    })
                    .await?;
                Ok(true)
            })
            .await?;
        }

        Ok(JobOutcome::ok(found, 0).with_details(json!({
            "failedJobs": scan.failed_jobs,
            "erroredIntegrations": scan.errored_integrations,
        })))
    }
}

fn summarize(ids: &[Uuid], results: Vec<Result<()>>) -> BatchSummary {
    let mut summary = BatchSummary::default();
    for (id, result) in ids.iter().zip(results) {
        match result {
            Ok(()) => summary.processed += 1,
            Err(e) => {
                warn!(archive_id = %id, error = %e, "Archive batch item failed");
                summary.failed += 1;
                summary.errors.push(format!("{}: {}", id, e));
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summarize_counts_each_result() {
        let ids = vec![Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
        let results = vec![
            Ok(()),
            Err(AppError::NotFound("archive".to_string())),
            Ok(()),
        ];
        let summary = summarize(&ids, results);
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed, 1);
        assert!(summary.errors[0].starts_with(&ids[1].to_string()));
    }
}
