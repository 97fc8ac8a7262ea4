//! 配置系统
//! 从环境变量加载所有配置，使用 Secret 包装敏感信息

use config::{Config, ConfigError, Environment};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// 监听地址，例如 "0.0.0.0:3000"
    pub addr: String,
    /// 优雅关闭超时时间（秒）
    pub graceful_shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// 数据库连接 URL（使用 Secret 包装，防止日志泄露）
    pub url: Secret<String>,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别: trace, debug, info, warn, error
    pub level: String,
    /// 日志格式: json, pretty
    pub format: String,
}

/// 外部平台连接器配置
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectorsConfig {
    /// 单次 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 可重试错误（5xx / 429）的最大重试次数
    pub max_retries: u32,
    /// 指数退避的基础延迟（毫秒）
    pub retry_base_delay_ms: u64,
    /// 分页大小
    pub page_size: u32,
    /// 单个平台最多拉取的页数，防止异常分页死循环
    pub max_pages: u32,
    /// 访问令牌到期前多少秒主动刷新
    pub refresh_skew_secs: i64,
}

/// 浪费估算使用的价格与阈值
#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    /// 每 GB 每月存储成本（美元）
    pub storage_cost_per_gb_month: f64,
    /// 每席位每月成本（美元）
    pub seat_cost_month: f64,
    /// 用户不活跃判定天数
    pub inactive_user_days: i64,
    /// 文件陈旧判定天数
    pub stale_file_days: i64,
    /// 频道休眠判定月数
    pub dormant_channel_months: i64,
    /// 频道休眠成员数上限（严格小于）
    pub dormant_channel_max_members: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// 存储类型: local, s3
    pub storage_type: String,
    pub local_base_path: String,
    pub s3_bucket: String,
    pub s3_region: Option<String>,
    pub s3_endpoint: Option<String>,
    pub s3_access_key: Option<Secret<String>>,
    pub s3_secret_key: Option<Secret<String>>,
    /// 迁移任务的旧存储路径（本地）
    pub legacy_local_path: Option<String>,
    /// 归档保留天数
    pub retention_days: i64,
    /// 批量操作并发度
    pub batch_concurrency: usize,
    /// STAGED 状态超时（小时）
    pub staged_timeout_hours: i64,
    /// 单租户归档量告警阈值（GB）
    pub high_usage_threshold_gb: f64,
    /// 到期提醒（到期前天数），从大到小
    pub warning_days: Vec<i64>,
    /// 执行 SAVINGS 剧本时是否先把文件复制到归档存储
    pub copy_on_execute: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutomationConfig {
    pub enabled: bool,
    /// 允许自动执行的套餐等级
    pub allowed_plans: Vec<String>,
    /// 自动审批的最大条目数
    pub max_items: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    /// 作业级最大尝试次数（与单次执行内的逐条容错无关）
    pub max_attempts: u32,
    /// 作业重投的基础退避
    pub retry_base_delay_ms: u64,
    /// 进程内队列容量
    pub queue_capacity: usize,
    /// 同时处理的作业数
    pub worker_concurrency: usize,
    /// 是否启动内置定时触发器
    pub scheduler_enabled: bool,
    pub expiry_sweep_interval_secs: u64,
    pub expiry_warning_interval_secs: u64,
    pub automation_interval_secs: u64,
    pub failure_monitor_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub slack_signing_secret: Option<Secret<String>>,
    pub google_channel_token: Option<Secret<String>>,
    pub figma_passcode: Option<Secret<String>>,
    pub jira_secret: Option<Secret<String>>,
    pub notion_secret: Option<Secret<String>>,
    /// 允许的时间戳偏差（秒）
    pub max_clock_skew_secs: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
    pub connectors: ConnectorsConfig,
    pub pricing: PricingConfig,
    pub archive: ArchiveConfig,
    pub automation: AutomationConfig,
    pub jobs: JobsConfig,
    pub webhooks: WebhookConfig,
}

impl AppConfig {
    /// 从环境变量加载配置
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut settings = Config::builder();

        settings = settings
            .set_default("server.addr", "0.0.0.0:3000")?
            .set_default("server.graceful_shutdown_timeout_secs", 30)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("database.acquire_timeout_secs", 30)?
            .set_default("database.idle_timeout_secs", 600)?
            .set_default("database.max_lifetime_secs", 1800)?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "json")?
            .set_default("connectors.request_timeout_secs", 30)?
            .set_default("connectors.max_retries", 3)?
            .set_default("connectors.retry_base_delay_ms", 500)?
            .set_default("connectors.page_size", 200)?
            .set_default("connectors.max_pages", 500)?
            .set_default("connectors.refresh_skew_secs", 300)?
            .set_default("pricing.storage_cost_per_gb_month", 0.023)?
            .set_default("pricing.seat_cost_month", 12.0)?
            .set_default("pricing.inactive_user_days", 90)?
            .set_default("pricing.stale_file_days", 365)?
            .set_default("pricing.dormant_channel_months", 12)?
            .set_default("pricing.dormant_channel_max_members", 5)?
            .set_default("archive.storage_type", "local")?
            .set_default("archive.local_base_path", "/var/lib/workspace-audit/archive")?
            .set_default("archive.s3_bucket", "workspace-audit-archive")?
            .set_default("archive.retention_days", 30)?
            .set_default("archive.batch_concurrency", 4)?
            .set_default("archive.staged_timeout_hours", 24)?
            .set_default("archive.high_usage_threshold_gb", 10.0)?
            .set_default("archive.warning_days", vec![7, 1])?
            .set_default("archive.copy_on_execute", true)?
            .set_default("automation.enabled", true)?
            .set_default("automation.allowed_plans", vec!["business", "enterprise"])?
            .set_default("automation.max_items", 10)?
            .set_default("jobs.max_attempts", 3)?
            .set_default("jobs.retry_base_delay_ms", 2000)?
            .set_default("jobs.queue_capacity", 1024)?
            .set_default("jobs.worker_concurrency", 4)?
            .set_default("jobs.scheduler_enabled", true)?
            .set_default("jobs.expiry_sweep_interval_secs", 86400)?
            .set_default("jobs.expiry_warning_interval_secs", 86400)?
            .set_default("jobs.automation_interval_secs", 604800)?
            .set_default("jobs.failure_monitor_interval_secs", 3600)?
            .set_default("webhooks.max_clock_skew_secs", 300)?;

        // 从环境变量加载配置（前缀为 WAUDIT_）
        settings = settings.add_source(
            Environment::with_prefix("WAUDIT")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("archive.warning_days")
                .with_list_parse_key("automation.allowed_plans")
                .try_parsing(true),
        );

        let config: AppConfig = settings.build()?.try_deserialize()?;

        config.validate()?;

        Ok(config)
    }

    /// 验证配置合法性
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.to_lowercase().as_str() {
            "json" | "pretty" => {}
            _ => {
                return Err(ConfigError::Message(format!(
                    "Invalid log format: {}. Must be one of: json, pretty",
                    self.logging.format
                )))
            }
        }

        if self.database.url.expose_secret().is_empty() {
            return Err(ConfigError::Message("database.url must be set".to_string()));
        }

        if self.database.max_connections < self.database.min_connections {
            return Err(ConfigError::Message(
                "max_connections must be >= min_connections".to_string(),
            ));
        }

        if self.connectors.request_timeout_secs == 0 {
            return Err(ConfigError::Message(
                "connectors.request_timeout_secs must be > 0; external calls need a finite timeout"
                    .to_string(),
            ));
        }

        match self.archive.storage_type.to_lowercase().as_str() {
            "local" | "s3" => {}
            other => {
                return Err(ConfigError::Message(format!(
                    "Invalid archive storage type: {}. Must be one of: local, s3",
                    other
                )))
            }
        }

        if self.archive.retention_days <= 0 {
            return Err(ConfigError::Message(
                "archive.retention_days must be positive".to_string(),
            ));
        }

        if !(1..=16).contains(&self.archive.batch_concurrency) {
            return Err(ConfigError::Message(
                "archive.batch_concurrency must be between 1 and 16".to_string(),
            ));
        }

        if self.archive.warning_days.iter().any(|d| *d <= 0) {
            return Err(ConfigError::Message(
                "archive.warning_days must contain positive day counts".to_string(),
            ));
        }

        if !(1..=10).contains(&self.jobs.max_attempts) {
            return Err(ConfigError::Message(
                "jobs.max_attempts must be between 1 and 10".to_string(),
            ));
        }

        Ok(())
    }
}
