//! 归档生命周期集成测试

use chrono::{DateTime, Duration, Utc};
use sqlx::types::Json;
use std::sync::Arc;
use uuid::Uuid;

mod common;
use common::TestApp;

use workspace_audit::{
    connectors::Connector,
    error::AppError,
    models::{
        archive::{ArchiveRequest, ArchiveStatus, ArchivedFile, OriginalLocation},
        integration::Platform,
        jobs::{JobEnvelope, JobEvent},
    },
    repository::ArchiveStore,
    services::{
        archive_service::ArchiveError,
        blob_store::{BlobStore, MemoryBlobStore},
        Notification,
    },
};

fn request(tenant_id: Uuid, external_id: &str) -> ArchiveRequest {
    ArchiveRequest {
        tenant_id,
        platform: Platform::GoogleWorkspace,
        external_id: external_id.to_string(),
        file_name: format!("{}.pdf", external_id),
        mime_type: Some("application/pdf".to_string()),
        original_location: OriginalLocation {
            path: format!("/Reports/{}.pdf", external_id),
            parent_id: Some("reports".to_string()),
            owner: Some("owner@example.com".to_string()),
        },
        requested_by: None,
    }
}

async fn drive_connector(app: &TestApp) -> (Uuid, Arc<dyn Connector>) {
    let tenant = app.seed_tenant("business").await;
    app.seed_integration(tenant.id, Platform::GoogleWorkspace).await;
    let connector = app
        .state
        .tokens
        .connector_for_platform(tenant.id, Platform::GoogleWorkspace, Utc::now())
        .await
        .unwrap();
    (tenant.id, connector)
}

async fn archived_at(app: &TestApp, external_id: &str, at: DateTime<Utc>) -> (ArchivedFile, Arc<dyn Connector>) {
    let (tenant_id, connector) = drive_connector(app).await;
    let file = app
        .state
        .archives
        .archive_at(&request(tenant_id, external_id), connector.as_ref(), at)
        .await
        .unwrap();
    (file, connector)
}

#[tokio::test]
async fn test_archive_stores_blob_and_starts_retention() {
    let app = TestApp::new();
    let t0 = Utc::now();
    let (file, _) = archived_at(&app, "q3-report", t0).await;

    assert_eq!(file.status, ArchiveStatus::Archived);
    assert_eq!(file.expires_at, t0 + Duration::days(30));
    assert_eq!(file.size_bytes, "contents of q3-report".len() as i64);
    assert!(file.content_sha256.is_some());
    assert!(app.blobs.contains(&file.storage_key));
    assert_eq!(app.publisher.names(), vec!["archive/file.created"]);
}

#[tokio::test]
async fn test_archiving_same_file_twice_returns_existing_record() {
    let app = TestApp::new();
    let (tenant_id, connector) = drive_connector(&app).await;
    let req = request(tenant_id, "contract");

    let first = app.state.archives.archive(&req, connector.as_ref()).await.unwrap();
    let second = app.state.archives.archive(&req, connector.as_ref()).await.unwrap();

    assert_eq!(first.id, second.id);
    assert_eq!(app.store.archives_for_tenant(tenant_id).await.len(), 1);
    assert_eq!(app.blobs.len(), 1);
}

#[tokio::test]
async fn test_restore_inside_retention_removes_blob() {
    let app = TestApp::new();
    let t0 = Utc::now() - Duration::days(29);
    let (file, connector) = archived_at(&app, "invoice", t0).await;

    let restored = app
        .state
        .archives
        .restore_via(file.id, None, connector.as_ref(), Utc::now())
        .await
        .unwrap();

    assert_eq!(restored.status, ArchiveStatus::Restored);
    assert_eq!(restored.restored_location.as_deref(), Some("restored-invoice.pdf"));
    assert!(restored.restored_at.is_some());
    assert!(!app.blobs.contains(&file.storage_key));
    assert!(app.behavior.calls().contains(&"upload_file:invoice.pdf".to_string()));
    assert!(app.publisher.names().contains(&"archive/file.restored"));
}

#[tokio::test]
async fn test_restore_after_retention_is_expired() {
    let app = TestApp::new();
    let t0 = Utc::now() - Duration::days(31);
    let (file, connector) = archived_at(&app, "old-deck", t0).await;

    let err = app
        .state
        .archives
        .restore_via(file.id, None, connector.as_ref(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Expired { .. }));
    assert!(matches!(AppError::from(err), AppError::Expired(_)));
    assert!(app.blobs.contains(&file.storage_key));
}

#[tokio::test]
async fn test_deleted_archive_cannot_be_restored() {
    let app = TestApp::new();
    let (file, connector) = archived_at(&app, "memo", Utc::now()).await;

    app.state
        .archives
        .cleanup_single_archive(file.id, Utc::now())
        .await
        .unwrap();
    assert!(!app.blobs.contains(&file.storage_key));

    let err = app
        .state
        .archives
        .restore_via(file.id, None, connector.as_ref(), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, ArchiveError::Deleted(_)));
    assert_eq!(AppError::from(err).code(), 409);
}

#[tokio::test]
async fn test_warning_thresholds_fire_once_each() {
    let app = TestApp::new();
    let now = Utc::now();
    // 6 天后到期：落在 7 天档
    let (file, _) = archived_at(&app, "budget", now - Duration::days(24)).await;

    let due = app.state.archives.due_warnings(now, &[7, 1]).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].0.id, file.id);
    assert_eq!(due[0].1, 7);

    app.state.archives.record_warning(file.id, 7).await.unwrap();
    assert!(app.state.archives.due_warnings(now, &[7, 1]).await.unwrap().is_empty());

    // 距到期不足一天时进入 1 天档
    let later = file.expires_at - Duration::hours(12);
    let due = app.state.archives.due_warnings(later, &[7, 1]).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].1, 1);
}

#[tokio::test]
async fn test_expiry_sweep_job_deletes_expired_archives() {
    let app = TestApp::new();
    let (expired, _) = archived_at(&app, "stale", Utc::now() - Duration::days(31)).await;
    let (live, _) = archived_at(&app, "fresh", Utc::now() - Duration::days(29)).await;

    let envelope = JobEnvelope {
        id: Some("sweep-1".to_string()),
        event: JobEvent::ArchiveExpirySweep,
    };
    let outcome = app.state.dispatcher.dispatch(&envelope).await.unwrap();
    assert_eq!(outcome.processed, 1);
    assert_eq!(outcome.failed, 0);

    let expired = app.state.archives.get(expired.id).await.unwrap();
    assert_eq!(expired.status, ArchiveStatus::Deleted);
    assert!(!app.blobs.contains(&expired.storage_key));
    let live = app.state.archives.get(live.id).await.unwrap();
    assert_eq!(live.status, ArchiveStatus::Archived);

    // 重投同一个事件直接返回保存的结果
    let again = app.state.dispatcher.dispatch(&envelope).await.unwrap();
    assert_eq!(again, outcome);
    let run = app.store.job_run(&envelope.idempotency_key()).await.unwrap();
    assert_eq!(run.attempts, 1);
}

#[tokio::test]
async fn test_expiry_warn_job_notifies_owner() {
    let app = TestApp::new();
    let (file, _) = archived_at(&app, "roadmap", Utc::now() - Duration::days(24)).await;

    let envelope = JobEnvelope {
        id: Some("warn-1".to_string()),
        event: JobEvent::ArchiveExpiryWarn,
    };
    let outcome = app.state.dispatcher.dispatch(&envelope).await.unwrap();
    assert_eq!(outcome.processed, 1);

    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Notification::ArchiveExpiring {
            archive_id,
            file_name,
            ..
        } => {
            assert_eq!(*archive_id, file.id);
            assert_eq!(file_name, "roadmap.pdf");
        }
        other => panic!("unexpected notification {:?}", other),
    }

    let stored = app.state.archives.get(file.id).await.unwrap();
    assert_eq!(stored.last_warning_days, Some(7));
}

#[tokio::test]
async fn test_storage_migration_copies_from_legacy_backend() {
    let app = TestApp::new();
    let (moved, _) = archived_at(&app, "ledger", Utc::now()).await;
    let (corrupt, _) = archived_at(&app, "payroll", Utc::now()).await;

    // 模拟旧存储里还有对象、新存储里没有
    let legacy = MemoryBlobStore::new();
    let bytes = app.blobs.get(&moved.storage_key).await.unwrap();
    legacy.put(&moved.storage_key, &bytes, None).await.unwrap();
    legacy
        .put(&corrupt.storage_key, b"truncated", None)
        .await
        .unwrap();
    app.blobs.delete(&moved.storage_key).await.unwrap();
    app.blobs.delete(&corrupt.storage_key).await.unwrap();

    let ids = [moved.id, corrupt.id];
    let report = app.state.archives.migrate_storage(&ids, &legacy).await.unwrap();
    assert_eq!((report.migrated, report.skipped, report.failed), (1, 0, 1));
    assert_eq!(app.blobs.get(&moved.storage_key).await.unwrap(), bytes);
    assert!(!app.blobs.contains(&corrupt.storage_key));

    // 已迁移的对象不再复制
    let again = app.state.archives.migrate_storage(&[moved.id], &legacy).await.unwrap();
    assert_eq!((again.migrated, again.skipped), (0, 1));
}

/// 直接写入存储的归档记录，用于构造回溯时间的状态
fn stored_row(tenant_id: Uuid, external_id: &str, status: ArchiveStatus, at: DateTime<Utc>, size_bytes: i64) -> ArchivedFile {
    let req = request(tenant_id, external_id);
    ArchivedFile {
        id: Uuid::new_v4(),
        tenant_id,
        platform: req.platform,
        external_id: req.external_id.clone(),
        file_name: req.file_name.clone(),
        mime_type: req.mime_type.clone(),
        size_bytes,
        content_sha256: None,
        storage_key: format!("{}/google_workspace/{}/{}", tenant_id, external_id, req.file_name),
        storage_url: None,
        status,
        original_location: Json(req.original_location.clone()),
        archived_by: None,
        archived_at: at,
        expires_at: ArchivedFile::expiry_for(at, 30),
        last_warning_days: None,
        restored_at: None,
        restored_location: None,
        deleted_at: None,
        created_at: at,
        updated_at: at,
    }
}

#[tokio::test]
async fn test_health_check_reports_orphaned_rows() {
    let app = TestApp::new();
    let (kept, _) = archived_at(&app, "kept", Utc::now()).await;
    let (lost, _) = archived_at(&app, "lost", Utc::now()).await;
    app.blobs.delete(&lost.storage_key).await.unwrap();

    let report = app.state.archives.health_check(Utc::now()).await.unwrap();
    assert_eq!(report.checked, 2);
    assert_eq!(report.orphaned, vec![lost.id]);
    assert!(!report.orphaned.contains(&kept.id));
    assert!(!report.is_healthy());
}

#[tokio::test]
async fn test_health_check_reports_stuck_staged_uploads() {
    let app = TestApp::new();
    let tenant_id = app.seed_tenant("business").await.id;
    let now = Utc::now();
    let stuck = stored_row(tenant_id, "stuck", ArchiveStatus::Staged, now - Duration::hours(25), 0);
    let recent = stored_row(tenant_id, "recent", ArchiveStatus::Staged, now - Duration::hours(23), 0);
    app.store.insert_archive(&stuck).await.unwrap();
    app.store.insert_archive(&recent).await.unwrap();

    let report = app.state.archives.health_check(now).await.unwrap();
    assert_eq!(report.stuck_staged, vec![stuck.id]);
    assert!(report.orphaned.is_empty());
}

#[tokio::test]
async fn test_health_check_reports_high_usage_tenants() {
    let app = TestApp::new();
    let heavy = app.seed_tenant("enterprise").await.id;
    let light = app.seed_tenant("business").await.id;
    let now = Utc::now();
    let gb = 1024 * 1024 * 1024_i64;
    for (tenant_id, name, size) in [
        (heavy, "backup-1", 6 * gb),
        (heavy, "backup-2", 5 * gb),
        (light, "backup-3", 9 * gb),
    ] {
        let row = stored_row(tenant_id, name, ArchiveStatus::Archived, now, size);
        app.store.insert_archive(&row).await.unwrap();
        app.blobs.put(&row.storage_key, b"x", None).await.unwrap();
    }

    let report = app.state.archives.health_check(now).await.unwrap();
    assert_eq!(report.high_usage_tenants.len(), 1);
    let usage = &report.high_usage_tenants[0];
    assert_eq!(usage.tenant_id, heavy);
    assert_eq!(usage.archived_bytes, 11 * gb);
    assert_eq!(usage.archive_count, 2);
    assert!(report.orphaned.is_empty());
}

#[tokio::test]
async fn test_resumed_staged_archive_restarts_retention() {
    let app = TestApp::new();
    let (tenant_id, connector) = drive_connector(&app).await;
    let first_attempt = Utc::now() - Duration::days(2);
    let staged = stored_row(tenant_id, "contract", ArchiveStatus::Staged, first_attempt, 0);
    app.store.insert_archive(&staged).await.unwrap();

    let now = Utc::now();
    let archived = app
        .state
        .archives
        .archive_at(&request(tenant_id, "contract"), connector.as_ref(), now)
        .await
        .unwrap();
    assert_eq!(archived.id, staged.id);
    assert_eq!(archived.status, ArchiveStatus::Archived);
    assert_eq!(archived.archived_at, now);
    assert_eq!(archived.expires_at, now + Duration::days(30));
}
