//! 撤销窗口与回放集成测试

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

mod common;
use common::TestApp;

use workspace_audit::{
    error::AppError,
    models::{
        integration::Platform,
        playbook::ImpactCategory,
        undo::{ActionType, AuditLogEntry, LogStatus},
    },
    repository::AuditLogStore,
    services::ExecutionMode,
};

/// 执行一个 Slack 休眠频道剧本，返回日志条目和执行时间
async fn executed_entry(app: &TestApp, items: usize) -> (AuditLogEntry, DateTime<Utc>) {
    let tenant = app.seed_tenant("business").await;
    app.seed_integration(tenant.id, Platform::Slack).await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, items)
        .await;

    let executed_at = Utc::now() - Duration::days(2);
    let report = app
        .state
        .executor
        .execute_at(playbook.id, Uuid::new_v4(), ExecutionMode::Manual, executed_at)
        .await
        .unwrap();
    let entry = app
        .store
        .get_entry(report.audit_log_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    (entry, executed_at)
}

#[tokio::test]
async fn test_undo_window_boundary() {
    let app = TestApp::new();
    let (entry, executed_at) = executed_entry(&app, 3).await;
    let deadline = executed_at + Duration::days(30);
    let actor = Uuid::new_v4();

    let late = app
        .state
        .undo
        .undo_entry_at(entry.id, actor, deadline + Duration::seconds(1))
        .await
        .unwrap_err();
    assert!(matches!(late, AppError::Expired(_)));

    // 截止时刻本身已经关闭
    let at_deadline = app
        .state
        .undo
        .undo_entry_at(entry.id, actor, deadline)
        .await
        .unwrap_err();
    assert!(matches!(at_deadline, AppError::Expired(_)));

    let report = app
        .state
        .undo
        .undo_entry_at(entry.id, actor, deadline - Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(report.restored, 3);
    assert_eq!(report.failed, 0);
    assert_eq!(report.status, LogStatus::Success);

    let stored = app.store.get_entry(entry.id).await.unwrap().unwrap();
    assert!(stored.undo_actions.is_empty());
    assert_eq!(stored.undone_by, Some(actor));
    assert!(app
        .behavior
        .calls()
        .contains(&"restore_channel:item-2".to_string()));
}

#[tokio::test]
async fn test_failed_undo_actions_stay_retryable() {
    let app = TestApp::new();
    let (entry, _) = executed_entry(&app, 3).await;
    let actor = Uuid::new_v4();
    app.behavior.fail_undo("item-1");

    let report = app.state.undo.undo_entry(entry.id, actor).await.unwrap();
    assert_eq!(report.restored, 2);
    assert_eq!(report.failed, 1);
    assert!(report.partial_undo);
    assert_eq!(report.errors[0].target_id, "item-1");

    let stored = app.store.get_entry(entry.id).await.unwrap().unwrap();
    assert_eq!(stored.undo_actions.len(), 1);
    assert_eq!(stored.undo_actions[0].target_id(), "item-1");
    assert!(stored.undone_at.is_none());

    app.behavior.heal_undo();
    let retry = app.state.undo.undo_entry(entry.id, actor).await.unwrap();
    assert_eq!(retry.restored, 1);
    assert!(!retry.partial_undo);

    let stored = app.store.get_entry(entry.id).await.unwrap().unwrap();
    assert!(stored.undo_actions.is_empty());
    assert!(stored.undone_at.is_some());
}

#[tokio::test]
async fn test_single_action_undo_writes_child_entry() {
    let app = TestApp::new();
    let (entry, _) = executed_entry(&app, 3).await;
    let actor = Uuid::new_v4();

    let report = app
        .state
        .undo
        .undo_action(entry.id, 1, actor)
        .await
        .unwrap();
    assert_eq!(report.restored, 1);
    assert_ne!(report.entry_id, entry.id);

    let child = app.store.get_entry(report.entry_id).await.unwrap().unwrap();
    assert_eq!(child.action_type, ActionType::UndoAction);
    assert_eq!(child.parent_entry_id, Some(entry.id));
    assert_eq!(child.target, "item-2");

    let parent = app.store.get_entry(entry.id).await.unwrap().unwrap();
    let remaining: Vec<&str> = parent.undo_actions.iter().map(|a| a.target_id()).collect();
    assert_eq!(remaining, vec!["item-1", "item-3"]);

    // 子条目本身不能再撤销
    let err = app
        .state
        .undo
        .undo_entry(child.id, actor)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_out_of_range_action_index() {
    let app = TestApp::new();
    let (entry, _) = executed_entry(&app, 2).await;

    let err = app
        .state
        .undo
        .undo_action(entry.id, 5, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::BadRequest(_)));
}

#[tokio::test]
async fn test_unknown_entry_is_not_found() {
    let app = TestApp::new();
    let err = app
        .state
        .undo
        .undo_entry(Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}
