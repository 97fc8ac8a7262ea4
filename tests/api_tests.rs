//! HTTP 接口测试

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use tower::ServiceExt;
use uuid::Uuid;

mod common;
use common::{read_json, TestApp};

use workspace_audit::models::{
    integration::Platform,
    jobs::{JobEnvelope, JobEvent},
    playbook::ImpactCategory,
};

fn post(uri: &str, actor: Option<Uuid>) -> Request<Body> {
    let mut builder = Request::builder().method("POST").uri(uri);
    if let Some(actor) = actor {
        builder = builder.header("x-actor-id", actor.to_string());
    }
    builder.body(Body::empty()).unwrap()
}

fn json_request(method: &str, uri: &str, actor: Uuid, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-actor-id", actor.to_string())
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health_endpoints() {
    let app = TestApp::new();

    let response = app
        .router()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = read_json(response).await;
    assert_eq!(json["status"], "ok");

    let response = app
        .router()
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["ready"], true);
}

#[tokio::test]
async fn test_trace_id_is_echoed() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .header("x-trace-id", "trace-abc")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.headers()["x-trace-id"], "trace-abc");
}

#[tokio::test]
async fn test_mutations_require_actor() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 1)
        .await;

    let response = app
        .router()
        .oneshot(post(&format!("/api/v1/playbooks/{}/approve", playbook.id), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let json = read_json(response).await;
    assert_eq!(json["error"]["code"], 401);
}

#[tokio::test]
async fn test_approve_twice_conflicts() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 1)
        .await;
    let actor = Uuid::new_v4();
    let uri = format!("/api/v1/playbooks/{}/approve", playbook.id);

    let response = app.router().oneshot(post(&uri, Some(actor))).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["status"], "APPROVED");
    assert_eq!(json["approved_by"], actor.to_string());

    let response = app.router().oneshot(post(&uri, Some(actor))).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_dismissed_playbook_cannot_be_executed() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 1)
        .await;
    let actor = Uuid::new_v4();

    let response = app
        .router()
        .oneshot(post(&format!("/api/v1/playbooks/{}/dismiss", playbook.id), Some(actor)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .router()
        .oneshot(post(&format!("/api/v1/playbooks/{}/execute", playbook.id), Some(actor)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    assert!(app.publisher.published().is_empty());
}

#[tokio::test]
async fn test_execute_enqueues_job() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 2)
        .await;
    let actor = Uuid::new_v4();

    let response = app
        .router()
        .oneshot(post(&format!("/api/v1/playbooks/{}/execute", playbook.id), Some(actor)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let json = read_json(response).await;
    assert_eq!(json["event"], "playbook/execute");

    let published = app.publisher.published();
    assert_eq!(published.len(), 1);
    match &published[0].event {
        JobEvent::PlaybookExecute(e) => {
            assert_eq!(e.playbook_id, playbook.id);
            assert_eq!(e.user_id, actor);
        }
        other => panic!("unexpected event {:?}", other),
    }
    // 只投递，不执行
    assert!(app.behavior.calls().is_empty());
}

#[tokio::test]
async fn test_trigger_audit_for_unknown_tenant() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(post(
            &format!("/api/v1/tenants/{}/audits", Uuid::new_v4()),
            Some(Uuid::new_v4()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_item_selection() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    let (playbook, items) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 2)
        .await;
    let actor = Uuid::new_v4();

    let response = app
        .router()
        .oneshot(json_request(
            "PUT",
            &format!("/api/v1/playbooks/{}/items/{}", playbook.id, items[0].id),
            actor,
            serde_json::json!({ "is_selected": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .router()
        .oneshot(json_request(
            "PUT",
            &format!("/api/v1/playbooks/{}/items/{}", playbook.id, Uuid::new_v4()),
            actor,
            serde_json::json!({ "is_selected": false }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .router()
        .oneshot(
            Request::builder()
                .uri(format!("/api/v1/playbooks/{}", playbook.id))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = read_json(response).await;
    let selected: Vec<bool> = json["items"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|i| i["id"] == items[0].id.to_string())
        .map(|i| i["is_selected"].as_bool().unwrap())
        .collect();
    assert_eq!(selected, vec![false]);
}

#[tokio::test]
async fn test_scheduler_event_runs_synchronously() {
    let app = TestApp::new();
    let tenant = app.seed_tenant("business").await;
    app.seed_integration(tenant.id, Platform::Slack).await;
    let (playbook, _) = app
        .seed_playbook(tenant.id, Platform::Slack, ImpactCategory::Efficiency, 3)
        .await;

    let envelope = serde_json::json!({
        "id": "evt-123",
        "name": "playbook/execute",
        "data": { "playbookId": playbook.id, "userId": Uuid::new_v4() },
    });
    let parsed: JobEnvelope = serde_json::from_value(envelope.clone()).unwrap();
    assert!(matches!(parsed.event, JobEvent::PlaybookExecute(_)));

    let response = app
        .router()
        .oneshot(json_request("POST", "/api/v1/events", Uuid::new_v4(), envelope))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = read_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["processed"], 3);
    assert_eq!(app.behavior.calls().len(), 3);
}

#[tokio::test]
async fn test_undo_unknown_entry_over_http() {
    let app = TestApp::new();
    let response = app
        .router()
        .oneshot(post(
            &format!("/api/v1/audit-logs/{}/undo", Uuid::new_v4()),
            Some(Uuid::new_v4()),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
