//! 路由注册
//! 创建所有 API 路由并应用中间件

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;

use crate::{handlers, middleware::AppState};

/// 同步请求（恢复、事件处理）的上限
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// 创建应用路由
pub fn create_router(state: Arc<AppState>) -> Router {
    // 公开端点（健康检查）
    let public_routes = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check));

    // 平台推送，按签名鉴权
    let webhook_routes = Router::new().route(
        "/webhooks/{platform}/{integration_id}",
        post(handlers::webhooks::receive_webhook),
    );

    // 调用方身份由上游网关写入 x-actor-id
    let api_routes = Router::new()
        .route("/api/v1/events", post(handlers::events::receive_event))
        // 审计
        .route(
            "/api/v1/tenants/{tenant_id}/audits",
            post(handlers::audits::trigger_audit),
        )
        .route("/api/v1/audits/{id}", get(handlers::audits::get_audit))
        // 剧本
        .route("/api/v1/playbooks/{id}", get(handlers::playbooks::get_playbook))
        .route(
            "/api/v1/playbooks/{id}/approve",
            post(handlers::playbooks::approve_playbook),
        )
        .route(
            "/api/v1/playbooks/{id}/dismiss",
            post(handlers::playbooks::dismiss_playbook),
        )
        .route(
            "/api/v1/playbooks/{id}/execute",
            post(handlers::playbooks::execute_playbook),
        )
        .route(
            "/api/v1/playbooks/{id}/items/{item_id}",
            put(handlers::playbooks::select_item),
        )
        // 撤销
        .route("/api/v1/audit-logs/{id}", get(handlers::undo::get_entry))
        .route("/api/v1/audit-logs/{id}/undo", post(handlers::undo::undo_entry))
        .route(
            "/api/v1/audit-logs/{id}/actions/{index}/undo",
            post(handlers::undo::undo_action),
        )
        // 归档
        .route("/api/v1/archives/health", get(handlers::archives::archive_health))
        .route(
            "/api/v1/archives/batch/restore",
            post(handlers::archives::batch_restore),
        )
        .route(
            "/api/v1/archives/batch/delete",
            post(handlers::archives::batch_delete),
        )
        .route("/api/v1/archives/{id}", get(handlers::archives::get_archive))
        .route(
            "/api/v1/archives/{id}/restore",
            post(handlers::archives::restore_archive),
        );

    Router::new()
        .merge(public_routes)
        .merge(webhook_routes)
        .merge(api_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(axum::middleware::from_fn(crate::middleware::request_tracking_middleware))
        .with_state(state)
}
