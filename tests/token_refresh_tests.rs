//! 令牌刷新测试

use chrono::{Duration, Utc};
use futures::future::join_all;

mod common;
use common::TestApp;

use workspace_audit::{
    models::integration::{ConnectorConfig, Integration, Platform, SyncStatus},
    repository::IntegrationStore,
};

async fn expiring_integration(app: &TestApp, expires_in_secs: i64) -> Integration {
    let tenant = app.seed_tenant("business").await;
    let mut credentials = ConnectorConfig::new(tenant.id, "stale-token");
    credentials.refresh_token = Some("refresh-1".to_string());
    credentials.expires_at = Some(Utc::now() + Duration::seconds(expires_in_secs));
    let integration = Integration::new(tenant.id, Platform::GoogleWorkspace, credentials);
    app.store.insert_integration(integration.clone()).await;
    integration
}

#[tokio::test]
async fn test_concurrent_callers_share_one_refresh() {
    let app = TestApp::new();
    // 60 秒后过期，落在 300 秒的提前量内
    let integration = expiring_integration(&app, 60).await;
    let now = Utc::now();

    let results = join_all((0..10).map(|_| app.state.tokens.connector_for(&integration, now))).await;
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(app.behavior.refreshes(), 1);

    let stored = app
        .store
        .get_integration(integration.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.credentials.access_token, "refreshed-1");
    assert_eq!(stored.credentials.refresh_token.as_deref(), Some("rotated-refresh"));
    assert!(stored.credentials.expires_at.unwrap() > now + Duration::minutes(30));
}

#[tokio::test]
async fn test_fresh_token_is_not_refreshed() {
    let app = TestApp::new();
    let integration = expiring_integration(&app, 3600).await;

    let credentials = app
        .state
        .tokens
        .fresh_credentials(&integration, Utc::now())
        .await
        .unwrap();
    assert_eq!(credentials.access_token, "stale-token");
    assert_eq!(app.behavior.refreshes(), 0);
}

#[tokio::test]
async fn test_rejected_refresh_marks_integration_errored() {
    let app = TestApp::new();
    let integration = expiring_integration(&app, 10).await;
    app.behavior.reject_refresh();

    let result = app
        .state
        .tokens
        .connector_for(&integration, Utc::now())
        .await;
    assert!(result.is_err());

    let stored = app
        .store
        .get_integration(integration.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored.last_error.unwrap().contains("invalid_grant"));
    assert_eq!(stored.credentials.access_token, "stale-token");
}

#[tokio::test]
async fn test_unsupported_refresh_fails_loudly() {
    let app = TestApp::new();
    let integration = expiring_integration(&app, -3600).await;
    app.behavior.refresh_unsupported();

    let result = app
        .state
        .tokens
        .fresh_credentials(&integration, Utc::now())
        .await;
    assert!(result.is_err());

    let stored = app
        .store
        .get_integration(integration.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Error);
    assert!(stored
        .last_error
        .unwrap()
        .contains("does not support token refresh"));
}
