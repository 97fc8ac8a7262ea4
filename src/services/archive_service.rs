//! 归档服务
//!
//! 把源平台的文件复制到归档存储并开始保留期计时，可以再推回源平台。
//! 状态：STAGED → ARCHIVED → RESTORED | DELETED

use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::blob_store::{archive_key, BlobStore};
use crate::config::ArchiveConfig;
use crate::connectors::{Connector, OperationError};
use crate::error::AppError;
use crate::jobs::EventPublisher;
use crate::models::archive::{
    ArchiveHealthReport, ArchiveRequest, ArchiveStatus, ArchivedFile, OriginalLocation,
    RestoreUpload,
};
use crate::models::jobs::{ArchiveFileEvent, JobEnvelope, JobEvent};
use crate::repository::{ArchiveStore, ArchiveTransition};
use sqlx::types::Json;

/// 归档错误
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("Archive not found: {0}")]
    NotFound(Uuid),

    #[error("Archive {0} has been deleted")]
    Deleted(Uuid),

    #[error("Archive {id} expired at {expires_at}")]
    Expired { id: Uuid, expires_at: DateTime<Utc> },

    #[error("Archive {id} is {status:?}, expected {expected}")]
    InvalidState {
        id: Uuid,
        status: ArchiveStatus,
        expected: &'static str,
    },

    #[error("Download from source failed: {0}")]
    Download(OperationError),

    #[error("Upload to source failed: {0}")]
    Upload(OperationError),

    #[error("Blob missing from storage: {0}")]
    BlobMissing(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Persistence(#[from] AppError),
}

impl ArchiveError {
    /// 源平台不支持下载（执行器据此跳过复制）
    pub fn is_download_unsupported(&self) -> bool {
        matches!(self, ArchiveError::Download(e) if e.is_unsupported())
    }
}

/// 单条清理的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Deleted,
    AlreadyDeleted,
}

/// 存储迁移统计
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MigrationReport {
    pub migrated: i64,
    pub skipped: i64,
    pub failed: i64,
}

#[derive(Debug, Clone)]
pub struct ArchivePolicy {
    pub retention_days: i64,
    pub staged_timeout_hours: i64,
    pub high_usage_threshold_bytes: i64,
}

impl ArchivePolicy {
    pub fn from_config(config: &ArchiveConfig) -> Self {
        Self {
            retention_days: config.retention_days,
            staged_timeout_hours: config.staged_timeout_hours,
            high_usage_threshold_bytes: (config.high_usage_threshold_gb * 1024.0 * 1024.0 * 1024.0)
                as i64,
        }
    }
}

impl Default for ArchivePolicy {
    fn default() -> Self {
        Self {
            retention_days: 30,
            staged_timeout_hours: 24,
            high_usage_threshold_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

pub struct ArchiveService {
    archives: Arc<dyn ArchiveStore>,
    blobs: Arc<dyn BlobStore>,
    events: Option<Arc<dyn EventPublisher>>,
    policy: ArchivePolicy,
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

impl ArchiveService {
    pub fn new(
        archives: Arc<dyn ArchiveStore>,
        blobs: Arc<dyn BlobStore>,
        policy: ArchivePolicy,
    ) -> Self {
        Self {
            archives,
            blobs,
            events: None,
            policy,
        }
    }

    /// 归档 / 恢复完成后投递事件
    pub fn with_events(mut self, events: Arc<dyn EventPublisher>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn policy(&self) -> &ArchivePolicy {
        &self.policy
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn get(&self, id: Uuid) -> Result<ArchivedFile, ArchiveError> {
        self.archives
            .get_archive(id)
            .await?
            .ok_or(ArchiveError::NotFound(id))
    }

    async fn publish(&self, event: JobEvent) {
        if let Some(events) = &self.events {
            if let Err(e) = events.publish(JobEnvelope::new(event)).await {
                warn!(error = %e, "Failed to publish archive event");
            }
        }
    }

    pub async fn archive(
        &self,
        request: &ArchiveRequest,
        source: &dyn Connector,
    ) -> Result<ArchivedFile, ArchiveError> {
        self.archive_at(request, source, Utc::now()).await
    }

    /// 下载源文件并写入存储
    ///
    /// 同一源文件已有 ARCHIVED 记录时直接返回；停在 STAGED 的记录会被续传，
    /// 保留期从真正写入成功的时刻起算
    #[instrument(skip(self, request, source), fields(tenant_id = %request.tenant_id, platform = %request.platform, external_id = %request.external_id))]
    pub async fn archive_at(
        &self,
        request: &ArchiveRequest,
        source: &dyn Connector,
        now: DateTime<Utc>,
    ) -> Result<ArchivedFile, ArchiveError> {
        let existing = self
            .archives
            .find_live_archive(request.tenant_id, request.platform, &request.external_id)
            .await?;

        if let Some(file) = existing.as_ref().filter(|f| f.status == ArchiveStatus::Archived) {
            debug!(archive_id = %file.id, "File already archived");
            return Ok(file.clone());
        }

        // 先下载，下载失败不留下 STAGED 记录
        let downloaded = source
            .download_file(&request.external_id)
            .await
            .map_err(ArchiveError::Download)?;

        let staged = match existing {
            Some(file) => file,
            None => {
                let file = ArchivedFile {
                    id: Uuid::new_v4(),
                    tenant_id: request.tenant_id,
                    platform: request.platform,
                    external_id: request.external_id.clone(),
                    file_name: request.file_name.clone(),
                    mime_type: request.mime_type.clone(),
                    size_bytes: 0,
                    content_sha256: None,
                    storage_key: archive_key(
                        request.tenant_id,
                        request.platform,
                        &request.external_id,
                        &request.file_name,
                    ),
                    storage_url: None,
                    status: ArchiveStatus::Staged,
                    original_location: Json(request.original_location.clone()),
                    archived_by: request.requested_by,
                    archived_at: now,
                    expires_at: ArchivedFile::expiry_for(now, self.policy.retention_days),
                    last_warning_days: None,
                    restored_at: None,
                    restored_location: None,
                    deleted_at: None,
                    created_at: now,
                    updated_at: now,
                };
                self.archives.insert_archive(&file).await?;
                file
            }
        };

        let mime_type = downloaded.mime_type.clone().or_else(|| request.mime_type.clone());
        let stored = self
            .blobs
            .put(&staged.storage_key, &downloaded.bytes, mime_type.as_deref())
            .await?;
        let sha = sha256_hex(&downloaded.bytes);
        let size = downloaded.bytes.len() as i64;

        let moved = self
            .archives
            .transition_archive(
                staged.id,
                &[ArchiveStatus::Staged],
                ArchiveTransition::Archived {
                    storage_key: stored.key,
                    storage_url: stored.url,
                    content_sha256: sha,
                    size_bytes: size,
                    mime_type,
                    archived_at: now,
                    expires_at: ArchivedFile::expiry_for(now, self.policy.retention_days),
                },
            )
            .await?;
        if !moved {
            debug!(archive_id = %staged.id, "Archive already left STAGED, keeping current state");
        }

        metrics::counter!("archive_bytes_stored", "backend" => self.blobs.backend())
            .increment(size.max(0) as u64);

        let archived = self.get(staged.id).await?;
        info!(archive_id = %archived.id, size_bytes = size, expires_at = %archived.expires_at, "File archived");

        self.publish(JobEvent::ArchiveFileCreated(ArchiveFileEvent {
            archive_id: archived.id,
            tenant_id: archived.tenant_id,
            file_name: archived.file_name.clone(),
            expires_at: Some(archived.expires_at),
            days_remaining: Some(archived.days_until_expiry(now)),
        }))
        .await;

        Ok(archived)
    }

    /// 用上传回调把文件推回源平台
    ///
    /// target_location 为空时回到记录的原始位置。已删除、已过期的归档拒绝恢复。
    #[instrument(skip(self, upload), fields(archive_id = %id))]
    pub async fn restore_with<F, Fut>(
        &self,
        id: Uuid,
        target_location: Option<String>,
        now: DateTime<Utc>,
        upload: F,
    ) -> Result<ArchivedFile, ArchiveError>
    where
        F: FnOnce(RestoreUpload) -> Fut + Send,
        Fut: Future<Output = Result<String, OperationError>> + Send,
    {
        let file = self.get(id).await?;
        match file.status {
            ArchiveStatus::Deleted => return Err(ArchiveError::Deleted(id)),
            ArchiveStatus::Restored => {
                debug!("Archive already restored");
                return Ok(file);
            }
            ArchiveStatus::Staged => {
                return Err(ArchiveError::InvalidState {
                    id,
                    status: file.status,
                    expected: "ARCHIVED",
                })
            }
            ArchiveStatus::Archived => {}
        }
        if file.is_expired_at(now) {
            return Err(ArchiveError::Expired {
                id,
                expires_at: file.expires_at,
            });
        }

        let bytes = self.blobs.get(&file.storage_key).await?;
        let target = target_location.or_else(|| file.original_location.parent_id.clone());

        let location = upload(RestoreUpload {
            archive_id: file.id,
            platform: file.platform,
            file_name: file.file_name.clone(),
            mime_type: file.mime_type.clone(),
            target_location: target,
            bytes,
        })
        .await
        .map_err(ArchiveError::Upload)?;

        let moved = self
            .archives
            .transition_archive(
                id,
                &[ArchiveStatus::Archived],
                ArchiveTransition::Restored {
                    at: now,
                    location: Some(location.clone()),
                },
            )
            .await?;

        if moved {
            // 已推回源平台，存储里的副本不再需要
            if let Err(e) = self.blobs.delete(&file.storage_key).await {
                warn!(error = %e, "Failed to delete restored archive blob");
            }
            info!(location = %location, "Archive restored");
            self.publish(JobEvent::ArchiveFileRestored(ArchiveFileEvent {
                archive_id: file.id,
                tenant_id: file.tenant_id,
                file_name: file.file_name.clone(),
                expires_at: None,
                days_remaining: None,
            }))
            .await;
        }

        self.get(id).await
    }

    /// 通过连接器的上传能力恢复
    pub async fn restore_via(
        &self,
        id: Uuid,
        target_location: Option<String>,
        connector: &dyn Connector,
        now: DateTime<Utc>,
    ) -> Result<ArchivedFile, ArchiveError> {
        self.restore_with(id, target_location, now, |upload| async move {
            connector.upload_file(&upload).await
        })
        .await
    }

    /// 删除存储对象并标记 DELETED；重复调用是无操作
    #[instrument(skip(self), fields(archive_id = %id))]
    pub async fn cleanup_single_archive(&self, id: Uuid, now: DateTime<Utc>) -> Result<CleanupOutcome, ArchiveError> {
        let file = self.get(id).await?;
        if file.status == ArchiveStatus::Deleted {
            return Ok(CleanupOutcome::AlreadyDeleted);
        }

        if matches!(file.status, ArchiveStatus::Staged | ArchiveStatus::Archived) {
            self.blobs.delete(&file.storage_key).await?;
        }

        let moved = self
            .archives
            .transition_archive(
                id,
                &[
                    ArchiveStatus::Staged,
                    ArchiveStatus::Archived,
                    ArchiveStatus::Restored,
                ],
                ArchiveTransition::Deleted { at: now },
            )
            .await?;

        if moved {
            info!(tenant_id = %file.tenant_id, "Archive deleted");
            Ok(CleanupOutcome::Deleted)
        } else {
            Ok(CleanupOutcome::AlreadyDeleted)
        }
    }

    /// 到期的 ARCHIVED 记录
    pub async fn expired(&self, now: DateTime<Utc>, limit: i64) -> Result<Vec<ArchivedFile>, ArchiveError> {
        Ok(self.archives.list_expired(now, limit).await?)
    }

    /// 需要发送到期提醒的记录及对应的提醒档位（天）
    ///
    /// 只取最小的已到达档位，且比上次已发档位更小时才提醒
    pub async fn due_warnings(
        &self,
        now: DateTime<Utc>,
        warning_days: &[i64],
    ) -> Result<Vec<(ArchivedFile, i64)>, ArchiveError> {
        let mut thresholds: Vec<i64> = warning_days.iter().copied().filter(|d| *d > 0).collect();
        thresholds.sort_unstable();
        thresholds.dedup();
        let Some(&widest) = thresholds.last() else {
            return Ok(vec![]);
        };

        let candidates = self.archives.list_expiring_within(now, widest).await?;
        let mut due = Vec::new();
        for file in candidates {
            let Some(&threshold) = thresholds
                .iter()
                .find(|d| file.expires_at <= now + Duration::days(**d))
            else {
                continue;
            };
            let already_sent = file
                .last_warning_days
                .map(|sent| i64::from(sent) <= threshold)
                .unwrap_or(false);
            if !already_sent {
                due.push((file, threshold));
            }
        }
        Ok(due)
    }

    pub async fn record_warning(&self, id: Uuid, days: i64) -> Result<(), ArchiveError> {
        Ok(self.archives.record_warning(id, days as i32).await?)
    }

    /// 健康检查：孤儿记录、卡在 STAGED、租户用量超阈值
    #[instrument(skip(self))]
    pub async fn health_check(&self, now: DateTime<Utc>) -> Result<ArchiveHealthReport, ArchiveError> {
        let mut report = ArchiveHealthReport::default();

        let archived = self
            .archives
            .list_by_status(None, ArchiveStatus::Archived)
            .await?;
        report.checked = archived.len();
        for file in &archived {
            match self.blobs.exists(&file.storage_key).await {
                Ok(true) => {}
                Ok(false) => report.orphaned.push(file.id),
                Err(e) => warn!(archive_id = %file.id, error = %e, "Could not check archive blob"),
            }
        }

        let cutoff = now - Duration::hours(self.policy.staged_timeout_hours);
        report.stuck_staged = self
            .archives
            .list_staged_before(cutoff)
            .await?
            .into_iter()
            .map(|f| f.id)
            .collect();

        report.high_usage_tenants = self
            .archives
            .usage_by_tenant()
            .await?
            .into_iter()
            .filter(|u| u.archived_bytes > self.policy.high_usage_threshold_bytes)
            .collect();

        if report.is_healthy() {
            debug!(checked = report.checked, "Archive health check passed");
        } else {
            warn!(
                orphaned = report.orphaned.len(),
                stuck_staged = report.stuck_staged.len(),
                "Archive health check found problems"
            );
        }
        Ok(report)
    }

    /// 把对象从旧后端复制到当前后端并改写存储键
    #[instrument(skip(self, legacy, ids), fields(count = ids.len()))]
    pub async fn migrate_storage(
        &self,
        ids: &[Uuid],
        legacy: &dyn BlobStore,
    ) -> Result<MigrationReport, ArchiveError> {
        let mut report = MigrationReport::default();
        for id in ids {
            match self.migrate_one(*id, legacy).await {
                Ok(true) => report.migrated += 1,
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    warn!(archive_id = %id, error = %e, "Storage migration failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            migrated = report.migrated,
            skipped = report.skipped,
            failed = report.failed,
            "Storage migration finished"
        );
        Ok(report)
    }

    async fn migrate_one(&self, id: Uuid, legacy: &dyn BlobStore) -> Result<bool, ArchiveError> {
        let file = self.get(id).await?;
        if file.status != ArchiveStatus::Archived {
            return Ok(false);
        }
        if self.blobs.exists(&file.storage_key).await? {
            return Ok(false);
        }

        let bytes = legacy.get(&file.storage_key).await?;
        if let Some(expected) = &file.content_sha256 {
            let actual = sha256_hex(&bytes);
            if &actual != expected {
                return Err(ArchiveError::Storage(format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    file.storage_key, expected, actual
                )));
            }
        }

        let stored = self
            .blobs
            .put(&file.storage_key, &bytes, file.mime_type.as_deref())
            .await?;
        self.archives
            .update_storage_location(id, &stored.key, stored.url.as_deref())
            .await?;
        Ok(true)
    }
}

/// 从剧本条目构造归档请求
pub fn request_for_item(
    tenant_id: Uuid,
    platform: crate::models::integration::Platform,
    item: &crate::models::playbook::PlaybookItem,
    requested_by: Option<Uuid>,
) -> Option<ArchiveRequest> {
    use crate::models::playbook::ItemMetadata;

    match &item.metadata.0 {
        ItemMetadata::File {
            original_path,
            parent_id,
            file_type,
            owner,
            ..
        } => Some(ArchiveRequest {
            tenant_id,
            platform,
            external_id: item.external_id.clone(),
            file_name: item.item_name.clone(),
            mime_type: file_type.contains('/').then(|| file_type.clone()),
            original_location: OriginalLocation {
                path: original_path.clone(),
                parent_id: parent_id.clone(),
                owner: owner.clone(),
            },
            requested_by,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_download_unsupported_detection() {
        let err = ArchiveError::Download(OperationError::unsupported(
            crate::models::integration::Platform::Figma,
            crate::connectors::Operation::DownloadFile,
        ));
        assert!(err.is_download_unsupported());
        assert!(!ArchiveError::NotFound(Uuid::nil()).is_download_unsupported());
    }

    #[test]
    fn test_policy_threshold_in_bytes() {
        let policy = ArchivePolicy::default();
        assert_eq!(policy.high_usage_threshold_bytes, 10_737_418_240);
    }
}
