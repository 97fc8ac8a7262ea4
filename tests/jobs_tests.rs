//! 作业分发与步骤重放测试

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

mod common;
use common::TestApp;

use workspace_audit::{
    error::AppError,
    jobs::{JobError, StepContext},
    models::{
        integration::Platform,
        jobs::{AuditRunEvent, JobEnvelope, JobEvent, JobRunStatus, PlaybookExecuteEvent},
        playbook::{ImpactCategory, PlaybookStatus},
    },
    repository::{JobRunStore, PlaybookStore},
    services::Notification,
};

#[tokio::test]
async fn test_completed_steps_are_not_rerun() {
    let app = TestApp::new();
    let store: Arc<dyn JobRunStore> = app.store.clone();
    let calls = AtomicUsize::new(0);

    let run = store.begin_run("replay:1", "test/replay", None).await.unwrap();
    let mut ctx = StepContext::new(run, store.clone());
    let first: i64 = ctx
        .step("count", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(41)
        })
        .await
        .unwrap();
    let failed = ctx
        .step::<i64, _, _>("explode", || async {
            Err(AppError::Internal("boom".to_string()))
        })
        .await
        .unwrap_err();
    assert!(matches!(failed, JobError::Step { ref step, .. } if step == "explode"));
    assert_eq!(ctx.executed_steps(), ["count".to_string()]);

    // 第二次尝试：已完成的步骤直接取保存的输出
    let run = store.begin_run("replay:1", "test/replay", None).await.unwrap();
    assert_eq!(run.attempts, 2);
    let mut ctx = StepContext::new(run, store.clone());
    assert!(ctx.is_completed("count"));
    let replayed: i64 = ctx
        .step("count", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        })
        .await
        .unwrap();
    assert_eq!(replayed, first);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(ctx.executed_steps().is_empty());
}

#[tokio::test]
async fn test_playbook_execute_job_runs_once() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    app.seed_integration(tenant.id, Platform::Slack).await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 2)
        .await;

    let envelope = JobEnvelope::new(JobEvent::PlaybookExecute(PlaybookExecuteEvent {
        playbook_id: playbook.id,
        user_id: Uuid::new_v4(),
    }));
    let outcome = app.state.dispatcher.dispatch(&envelope).await.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.processed, 2);

    let replay = app.state.dispatcher.dispatch(&envelope).await.unwrap();
    assert_eq!(replay, outcome);
    assert_eq!(app.behavior.calls().len(), 2);

    let run = app.store.job_run(&envelope.idempotency_key()).await.unwrap();
    assert_eq!(run.status, JobRunStatus::Completed);
    assert_eq!(run.attempts, 1);
    assert!(run.completed_steps.contains_key("execute"));

    let stored = app.store.get_playbook(playbook.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PlaybookStatus::Executed);
}

#[tokio::test]
async fn test_retryable_failure_exhausts_attempts() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    app.seed_integration(tenant.id, Platform::Slack).await;
    app.behavior.fail_fetch(Platform::Slack);

    let envelope = JobEnvelope {
        id: Some("audit-1".to_string()),
        event: JobEvent::AuditRun(AuditRunEvent {
            tenant_id: tenant.id,
            user_id: Uuid::new_v4(),
        }),
    };

    for attempt in 1..=3 {
        let err = app.state.dispatcher.dispatch(&envelope).await.unwrap_err();
        assert!(err.is_retryable(), "attempt {} should be retryable", attempt);
    }

    // 只有最后一次尝试发出告警
    let sent = app.notifier.sent();
    assert_eq!(sent.len(), 1);
    match &sent[0] {
        Notification::JobFailed {
            job_key,
            event_name,
            attempts,
            ..
        } => {
            assert_eq!(job_key, &envelope.idempotency_key());
            assert_eq!(event_name, "audit/run");
            assert_eq!(*attempts, 3);
        }
        other => panic!("unexpected notification {:?}", other),
    }

    let err = app.state.dispatcher.dispatch(&envelope).await.unwrap_err();
    assert!(matches!(err, JobError::AttemptsExhausted { attempts: 3, .. }));
    assert!(!err.is_retryable());

    let run = app.store.job_run(&envelope.idempotency_key()).await.unwrap();
    assert_eq!(run.status, JobRunStatus::Failed);
}

#[tokio::test]
async fn test_permanent_failure_notifies_immediately() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("free").await;

    // 没有集成：校验错误，重试无意义
    let envelope = JobEnvelope {
        id: Some("audit-2".to_string()),
        event: JobEvent::AuditRun(AuditRunEvent {
            tenant_id: tenant.id,
            user_id: Uuid::new_v4(),
        }),
    };
    let err = app.state.dispatcher.dispatch(&envelope).await.unwrap_err();
    assert!(!err.is_retryable());
    assert_eq!(app.notifier.sent().len(), 1);
}

#[tokio::test]
async fn test_failure_monitor_reports_failed_jobs_and_errored_integrations() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let slack = app.seed_integration(tenant.id, Platform::Slack).await;
    app.behavior.fail_fetch(Platform::Slack);

    let audit = JobEnvelope {
        id: Some("audit-3".to_string()),
        event: JobEvent::AuditRun(AuditRunEvent {
            tenant_id: tenant.id,
            user_id: Uuid::new_v4(),
        }),
    };
    app.state.dispatcher.dispatch(&audit).await.unwrap_err();

    let monitor = JobEnvelope {
        id: Some("monitor-1".to_string()),
        event: JobEvent::FailureMonitor,
    };
    let outcome = app.state.dispatcher.dispatch(&monitor).await.unwrap();
    assert_eq!(outcome.processed, 2);

    let digest = app
        .notifier
        .sent()
        .into_iter()
        .find(|n| matches!(n, Notification::FailureDigest { .. }))
        .expect("failure digest");
    match digest {
        Notification::FailureDigest {
            failed_jobs,
            errored_integrations,
        } => {
            assert_eq!(failed_jobs, vec![audit.idempotency_key()]);
            assert_eq!(errored_integrations, vec![slack.id]);
        }
        _ => unreachable!(),
    }
}
