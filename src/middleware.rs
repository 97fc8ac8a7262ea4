//! HTTP 中间件
//! 应用状态、请求追踪、调用方身份

use axum::{
    extract::{FromRequestParts, Request},
    http::{request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::connectors::ConnectorRegistry;
use crate::error::AppError;
use crate::jobs::{EventPublisher, JobDispatcher, JobHandlers};
use crate::repository::Stores;
use crate::services::{
    ArchivePolicy, ArchiveService, AuditAggregator, AutomationPolicy, AutomationService,
    BlobStore, GeneratorPolicy, Notifier, PlaybookExecutor, PlaybookGenerator, ScoringPolicy,
    TokenService, UndoService,
};
use crate::webhooks::{VerifierSet, WebhookService};

/// 组装服务所需的外部协作方
pub struct Collaborators {
    pub registry: ConnectorRegistry,
    pub blobs: Arc<dyn BlobStore>,
    pub legacy_blobs: Option<Arc<dyn BlobStore>>,
    pub notifier: Arc<dyn Notifier>,
    /// 作业投递出口（进程内队列或外部调度器）
    pub publisher: Arc<dyn EventPublisher>,
}

/// 应用状态
///
/// 服务都用 Arc 包装，请求之间共享
#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    /// 内存存储运行时为空
    pub db: Option<PgPool>,
    pub stores: Stores,
    pub tokens: TokenService,
    pub aggregator: Arc<AuditAggregator>,
    pub executor: Arc<PlaybookExecutor>,
    pub undo: Arc<UndoService>,
    pub archives: Arc<ArchiveService>,
    pub automation: Arc<AutomationService>,
    pub webhooks: Arc<WebhookService>,
    pub dispatcher: Arc<JobDispatcher>,
    pub publisher: Arc<dyn EventPublisher>,
}

impl AppState {
    /// 按配置把存储和协作方接成完整的服务图
    pub fn build(config: AppConfig, db: Option<PgPool>, stores: Stores, deps: Collaborators) -> Self {
        let tokens = TokenService::new(
            stores.integrations.clone(),
            deps.registry,
            config.connectors.refresh_skew_secs,
        );

        let archives = Arc::new(
            ArchiveService::new(
                stores.archives.clone(),
                deps.blobs,
                ArchivePolicy::from_config(&config.archive),
            )
            .with_events(deps.publisher.clone()),
        );

        let aggregator = Arc::new(AuditAggregator::new(
            stores.integrations.clone(),
            stores.audits.clone(),
            tokens.clone(),
            ScoringPolicy::from_config(&config.pricing),
            PlaybookGenerator::new(GeneratorPolicy::from_config(&config.pricing, &config.automation)),
        ));

        let mut executor = PlaybookExecutor::new(
            stores.playbooks.clone(),
            stores.audit_logs.clone(),
            stores.audits.clone(),
            stores.integrations.clone(),
            tokens.clone(),
        );
        if config.archive.copy_on_execute {
            executor = executor.with_archive_copy(archives.clone());
        }
        let executor = Arc::new(executor);

        let undo = Arc::new(UndoService::new(
            stores.audit_logs.clone(),
            stores.integrations.clone(),
            tokens.clone(),
        ));

        let automation = Arc::new(AutomationService::new(
            stores.tenants.clone(),
            stores.playbooks.clone(),
            executor.clone(),
            AutomationPolicy::from_config(&config.automation),
        ));

        let webhooks = Arc::new(WebhookService::new(
            VerifierSet::from_config(&config.webhooks),
            stores.integrations.clone(),
            deps.publisher.clone(),
        ));

        let handlers = Arc::new(JobHandlers {
            aggregator: aggregator.clone(),
            executor: executor.clone(),
            archives: archives.clone(),
            automation: automation.clone(),
            tokens: tokens.clone(),
            integrations: stores.integrations.clone(),
            job_runs: stores.job_runs.clone(),
            notifier: deps.notifier.clone(),
            legacy_blobs: deps.legacy_blobs,
            warning_days: config.archive.warning_days.clone(),
            batch_concurrency: config.archive.batch_concurrency,
        });

        let dispatcher = Arc::new(JobDispatcher::new(
            stores.job_runs.clone(),
            handlers,
            deps.notifier,
            config.jobs.max_attempts as i32,
        ));

        Self {
            config,
            db,
            stores,
            tokens,
            aggregator,
            executor,
            undo,
            archives,
            automation,
            webhooks,
            dispatcher,
            publisher: deps.publisher,
        }
    }
}

/// 发起操作的用户，由上游网关写入 `x-actor-id`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActorId(pub Uuid);

impl<S> FromRequestParts<S> for ActorId
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get("x-actor-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v.trim()).ok())
            .map(ActorId)
            .ok_or(AppError::Unauthorized)
    }
}

/// 请求追踪中间件
/// 为每个请求生成 trace_id 和 request_id，并记录指标
pub async fn request_tracking_middleware(req: Request, next: Next) -> Response {
    let trace_id = extract_or_generate_trace_id(req.headers());
    let request_id = Uuid::new_v4().to_string();

    let method = req.method().to_string();
    let uri = req.uri().path().to_string();

    let span = tracing::info_span!(
        "http_request",
        trace_id = %trace_id,
        request_id = %request_id,
        method = %method,
        uri = %uri,
    );

    async move {
        let start = Instant::now();
        let mut response = next.run(req).await;
        let elapsed = start.elapsed();

        let status = response.status().as_u16();
        let method_name = match method.as_str() {
            "GET" => "GET",
            "POST" => "POST",
            "PUT" => "PUT",
            "DELETE" => "DELETE",
            "PATCH" => "PATCH",
            _ => "UNKNOWN",
        };
        let status_class = match status {
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };

        metrics::counter!("http_requests_total", "method" => method_name, "status" => status_class)
            .increment(1);
        metrics::histogram!("http_request_duration_seconds").record(elapsed.as_secs_f64());

        tracing::info!(
            method = %method,
            uri = %uri,
            status = status,
            elapsed_ms = elapsed.as_millis() as u64,
            "Request completed"
        );

        if let Ok(value) = HeaderValue::from_str(&trace_id) {
            response.headers_mut().insert("x-trace-id", value);
        }
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers_mut().insert("x-request-id", value);
        }
        response
    }
    .instrument(span)
    .await
}

/// 从请求头中提取或生成 trace_id
fn extract_or_generate_trace_id(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request as HttpRequest;

    #[test]
    fn test_extract_or_generate_trace_id() {
        let mut headers = HeaderMap::new();
        headers.insert("x-trace-id", "test-trace-123".parse().unwrap());

        let trace_id = extract_or_generate_trace_id(&headers);
        assert_eq!(trace_id, "test-trace-123");

        let headers = HeaderMap::new();
        let trace_id = extract_or_generate_trace_id(&headers);
        assert!(!trace_id.is_empty());
        assert_ne!(trace_id, "test-trace-123");
    }

    #[tokio::test]
    async fn test_actor_id_extraction() {
        let actor = Uuid::new_v4();
        let (mut parts, _) = HttpRequest::builder()
            .header("x-actor-id", actor.to_string())
            .body(())
            .unwrap()
            .into_parts();
        let extracted = ActorId::from_request_parts(&mut parts, &()).await.unwrap();
        assert_eq!(extracted, ActorId(actor));

        let (mut parts, _) = HttpRequest::builder().body(()).unwrap().into_parts();
        let missing = ActorId::from_request_parts(&mut parts, &()).await;
        assert!(matches!(missing, Err(AppError::Unauthorized)));
    }
}
