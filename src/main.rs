//! 工作区审计服务主入口

use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use workspace_audit::{
    config::AppConfig,
    connectors::{http::HttpSettings, ConnectorRegistry},
    db,
    handlers::health,
    jobs::{EventPublisher, JobQueue, RetryPolicy, Scheduler},
    middleware::{AppState, Collaborators},
    repository::Stores,
    routes,
    services::{
        blob_store::{blob_store_from_config, legacy_blob_store},
        LogNotifier,
    },
    telemetry,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ===== CLI 参数处理 =====
    let args: Vec<String> = std::env::args().collect();

    if args.len() > 1 {
        match args[1].as_str() {
            "--version" => {
                println!("workspace-audit {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" => {
                print_help();
                return Ok(());
            }
            _ => {
                eprintln!("未知参数: {}", args[1]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    // 加载 .env 文件（开发环境）
    // 按优先级加载：.env.local > .env.development > .env
    if let Ok(env) = std::env::var("WAUDIT_ENV") {
        dotenv::from_filename(format!(".env.{}", env)).ok();
    } else {
        dotenv::from_filename(".env.local").ok();
        dotenv::from_filename(".env.development").ok();
        dotenv::dotenv().ok();
    }

    health::set_start_time();

    // 1. 加载配置
    let config = AppConfig::from_env().map_err(|e| {
        eprintln!("Configuration error: {}", e);
        anyhow::anyhow!("Failed to load configuration: {}", e)
    })?;

    // 2. 初始化日志与指标
    telemetry::init_telemetry(&config);
    telemetry::init_metrics();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Workspace audit service starting...");

    // 3. 数据库连接池 + 迁移
    let db_pool = db::create_pool(&config.database).await?;
    db::run_migrations(&db_pool).await?;
    tracing::info!("Database initialized");

    // 4. 作业队列先于服务创建，归档服务要向它投递生命周期事件
    let (queue, receiver) = JobQueue::channel(config.jobs.queue_capacity);
    let publisher: Arc<dyn EventPublisher> = Arc::new(queue);

    let blobs = blob_store_from_config(&config.archive)?;
    tracing::info!(backend = blobs.backend(), "Archive storage ready");

    let state = AppState::build(
        config.clone(),
        Some(db_pool.clone()),
        Stores::postgres(db_pool.clone()),
        Collaborators {
            registry: ConnectorRegistry::with_defaults(HttpSettings::from_config(&config.connectors)),
            blobs,
            legacy_blobs: legacy_blob_store(&config.archive),
            notifier: Arc::new(LogNotifier),
            publisher: publisher.clone(),
        },
    );
    let app_state = Arc::new(state);

    // 5. 后台作业
    let worker = receiver.spawn(
        app_state.dispatcher.clone(),
        config.jobs.worker_concurrency,
        RetryPolicy {
            max_attempts: config.jobs.max_attempts,
            base_delay: Duration::from_millis(config.jobs.retry_base_delay_ms),
        },
    );
    let triggers = if config.jobs.scheduler_enabled {
        Scheduler::from_config(publisher.clone(), &config.jobs).spawn()
    } else {
        tracing::info!("Built-in scheduler disabled, relying on external scheduler");
        Vec::new()
    };

    // 6. 构建路由并启动服务器
    let app = routes::create_router(app_state.clone());
    let addr = &config.server.addr;
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(addr = %addr, "Server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 7. 停止定时触发，给在途作业留出收尾时间
    for trigger in triggers {
        trigger.abort();
    }
    let grace = Duration::from_secs(config.server.graceful_shutdown_timeout_secs);
    if !worker.shutdown(grace).await {
        tracing::warn!("Graceful shutdown timeout reached, abandoning in-flight jobs");
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// 优雅关闭信号处理
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Ctrl+C received, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Terminate signal received, starting graceful shutdown");
        },
    }
}

/// 打印帮助信息
fn print_help() {
    println!("workspace-audit {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("用法: workspace-audit [选项]");
    println!();
    println!("选项:");
    println!("  --version     打印版本信息并退出");
    println!("  --help        打印此帮助信息并退出");
    println!();
    println!("环境变量:");
    println!("  所有配置通过 WAUDIT_ 前缀的环境变量完成（例如 WAUDIT_DATABASE__URL）");
}
