//! Webhook 入口测试

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use tower::ServiceExt;
use uuid::Uuid;

mod common;
use common::{read_json, TestApp, SLACK_SECRET};

use workspace_audit::{
    models::{integration::Platform, jobs::JobEvent},
    webhooks::verify::slack_signature,
};

fn slack_request(integration_id: Uuid, body: &str, signature: &str, ts: i64) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/webhooks/slack/{}", integration_id))
        .header("content-type", "application/json")
        .header("x-slack-signature", signature)
        .header("x-slack-request-timestamp", ts.to_string())
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_signed_slack_event_requests_sync() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let integration = app.seed_integration(tenant.id, Platform::Slack).await;

    let body = r#"{"type":"event_callback","event":{"type":"channel_archive"}}"#;
    let ts = Utc::now().timestamp();
    let signature = slack_signature(SLACK_SECRET, ts, body.as_bytes()).unwrap();

    let response = app
        .router()
        .oneshot(slack_request(integration.id, body, &signature, ts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["accepted"], true);

    let published = app.publisher.published();
    assert_eq!(published.len(), 1);
    match &published[0].event {
        JobEvent::IntegrationsSync(sync) => {
            assert_eq!(sync.tenant_id, tenant.id);
            assert_eq!(sync.source, Some(Platform::Slack));
            assert!(sync.user_id.is_none());
        }
        other => panic!("unexpected event {:?}", other),
    }
}

#[tokio::test]
async fn test_bad_signature_is_rejected() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let integration = app.seed_integration(tenant.id, Platform::Slack).await;

    let body = r#"{"type":"event_callback"}"#;
    let ts = Utc::now().timestamp();
    let signature = slack_signature("some-other-secret", ts, body.as_bytes()).unwrap();

    let response = app
        .router()
        .oneshot(slack_request(integration.id, body, &signature, ts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(app.publisher.published().is_empty());
}

#[tokio::test]
async fn test_replayed_timestamp_is_rejected() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let integration = app.seed_integration(tenant.id, Platform::Slack).await;

    let body = r#"{"type":"event_callback"}"#;
    let ts = Utc::now().timestamp() - 3600;
    let signature = slack_signature(SLACK_SECRET, ts, body.as_bytes()).unwrap();

    let response = app
        .router()
        .oneshot(slack_request(integration.id, body, &signature, ts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_url_verification_echoes_challenge() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let integration = app.seed_integration(tenant.id, Platform::Slack).await;

    let body = r#"{"type":"url_verification","challenge":"3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"}"#;
    let ts = Utc::now().timestamp();
    let signature = slack_signature(SLACK_SECRET, ts, body.as_bytes()).unwrap();

    let response = app
        .router()
        .oneshot(slack_request(integration.id, body, &signature, ts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(
        json["challenge"],
        "3eZbrw1aBm2rZgRNFdxV2595E9CY3gmdALWMmHkvFXO7tYXAYM8P"
    );
    assert!(app.publisher.published().is_empty());
}

#[tokio::test]
async fn test_unknown_integration_is_not_found() {
    let app = TestApp::new();
    let body = r#"{"type":"event_callback"}"#;
    let ts = Utc::now().timestamp();
    let signature = slack_signature(SLACK_SECRET, ts, body.as_bytes()).unwrap();

    let response = app
        .router()
        .oneshot(slack_request(Uuid::new_v4(), body, &signature, ts))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_unknown_or_unconfigured_platform_is_bad_request() {
    let app = TestApp::new();

    let unknown = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/dropbox/{}", Uuid::new_v4()))
        .body(Body::from("{}"))
        .unwrap();
    let response = app.router().oneshot(unknown).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // 测试配置里没有 Jira 密钥
    let unconfigured = Request::builder()
        .method("POST")
        .uri(format!("/webhooks/jira/{}", Uuid::new_v4()))
        .body(Body::from("{}"))
        .unwrap();
    let response = app.router().oneshot(unconfigured).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
