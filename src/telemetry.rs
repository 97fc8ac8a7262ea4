//! 日志与追踪系统
//! 初始化结构化日志和指标收集

use crate::config::AppConfig;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// 初始化日志与追踪系统
pub fn init_telemetry(config: &AppConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let log_layer = match config.logging.format.to_lowercase().as_str() {
        "json" => tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
            .boxed(),
        "pretty" => tracing_subscriber::fmt::layer()
            .pretty()
            .with_target(false)
            .boxed(),
        _ => tracing_subscriber::fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(log_layer)
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        level = %config.logging.level,
        format = %config.logging.format,
        "Telemetry initialized"
    );
}

/// 预先声明指标说明
/// metrics 0.24 的指标在首次使用时自动创建，这里只补充描述信息
pub fn init_metrics() {
    metrics::describe_counter!(
        "connector_requests_total",
        "Outbound requests to third-party platforms by platform and outcome"
    );
    metrics::describe_counter!(
        "playbook_items_processed_total",
        "Playbook items processed by outcome"
    );
    metrics::describe_counter!("archive_bytes_stored", "Bytes written to archive storage");
    metrics::describe_counter!("job_runs_total", "Background job runs by event and outcome");
    tracing::debug!("Metrics initialized");
}
