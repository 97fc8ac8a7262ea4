//! 连接器共用的 HTTP 客户端
//! 有限超时、可重试错误的指数退避（遵守 Retry-After）以及分页

use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::ConnectorError;
use crate::config::ConnectorsConfig;
use crate::models::integration::Platform;

/// 退避上限，防止 Retry-After 给出离谱的值
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// 平台错误响应里可能回显的凭据
static SECRET_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"xox[abposr]-[A-Za-z0-9-]+",
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]+",
        r#"(?i)"?(access_token|refresh_token|client_secret)"?\s*[:=]\s*"?[^\s",}]+"#,
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// HTTP 行为参数
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub page_size: u32,
    pub max_pages: u32,
}

impl HttpSettings {
    pub fn from_config(config: &ConnectorsConfig) -> Self {
        Self {
            timeout: Duration::from_secs(config.request_timeout_secs),
            max_retries: config.max_retries,
            retry_base_delay: Duration::from_millis(config.retry_base_delay_ms),
            page_size: config.page_size,
            max_pages: config.max_pages,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            page_size: 200,
            max_pages: 500,
        }
    }
}

/// 平台 API 客户端
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    platform: Platform,
    settings: HttpSettings,
}

impl ApiClient {
    pub fn new(
        platform: Platform,
        base_url: impl Into<String>,
        settings: HttpSettings,
    ) -> Result<Self, ConnectorError> {
        let client = Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("workspace-audit/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ConnectorError::new("client_build", e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            platform,
            settings,
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 拼接完整 URL；已经是绝对地址时原样返回
    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            path.to_string()
        } else {
            format!("{}/{}", self.base_url, path.trim_start_matches('/'))
        }
    }

    /// 发送请求并在可重试错误上退避重试
    ///
    /// `build` 每次重试都会被调用一次以重建请求
    pub async fn execute<F>(&self, build: F) -> Result<Response, ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = build(&self.client).send().await;

            let (error, retry_after) = match result {
                Ok(response) if response.status().is_success() => {
                    metrics::counter!(
                        "connector_requests_total",
                        "platform" => self.platform.as_str(),
                        "outcome" => "success"
                    )
                    .increment(1);
                    return Ok(response);
                }
                Ok(response) => {
                    let status = response.status();
                    let retry_after = parse_retry_after(&response);
                    let body = response.text().await.unwrap_or_default();
                    (ConnectorError::from_status(status.as_u16(), truncate(&redact(&body))), retry_after)
                }
                Err(e) if e.is_timeout() => (ConnectorError::timeout(e.to_string()), None),
                Err(e) if e.is_connect() || e.is_request() => {
                    (ConnectorError::network(e.to_string()), None)
                }
                Err(e) => (ConnectorError::new("http", e.to_string()), None),
            };

            metrics::counter!(
                "connector_requests_total",
                "platform" => self.platform.as_str(),
                "outcome" => if error.retryable { "retryable" } else { "error" }
            )
            .increment(1);

            if !error.retryable || attempt >= self.settings.max_retries {
                return Err(error);
            }

            let delay = retry_after
                .unwrap_or_else(|| with_jitter(backoff(self.settings.retry_base_delay, attempt)));
            warn!(
                platform = %self.platform,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retryable connector error, backing off"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    /// 发送请求并解析 JSON 响应
    pub async fn json<T, F>(&self, build: F) -> Result<T, ConnectorError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.execute(build).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| ConnectorError::decode(format!("{} response: {}", self.platform, e)))
    }

    /// 发送请求，丢弃响应体
    pub async fn send<F>(&self, build: F) -> Result<(), ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        self.execute(build).await.map(|_| ())
    }

    /// 下载二进制内容
    pub async fn bytes<F>(&self, build: F) -> Result<(Vec<u8>, Option<String>), ConnectorError>
    where
        F: Fn(&Client) -> RequestBuilder + Send + Sync,
    {
        let response = self.execute(build).await?;
        let mime = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ConnectorError::network(e.to_string()))?;
        debug!(platform = %self.platform, size = bytes.len(), "Downloaded content");
        Ok((bytes.to_vec(), mime))
    }
}

/// 指数退避：base × 2^attempt，封顶
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.min(16));
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

/// 叠加至多 20% 的随机抖动，错开同时重试的调用方
fn with_jitter(delay: Duration) -> Duration {
    let max_ms = (delay.as_millis() as u64) / 5;
    if max_ms == 0 {
        return delay;
    }
    let extra = rand::thread_rng().gen_range(0..=max_ms);
    (delay + Duration::from_millis(extra)).min(MAX_BACKOFF)
}

/// 抹掉响应体里的令牌，错误信息会落库到 last_error
pub fn redact(body: &str) -> String {
    SECRET_PATTERNS
        .iter()
        .fold(body.to_string(), |acc, re| re.replace_all(&acc, "[REDACTED]").into_owned())
}

/// 解析 Retry-After（只支持秒数形式）
fn parse_retry_after(response: &Response) -> Option<Duration> {
    if response.status() != StatusCode::TOO_MANY_REQUESTS
        && !response.status().is_server_error()
    {
        return None;
    }
    response
        .headers()
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_BACKOFF))
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 512;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut end = LIMIT;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}

/// 一页结果
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 下一页游标（游标 / 页码 / 偏移量统一编码为字符串）
    pub next: Option<String>,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, next: Option<String>) -> Self {
        // 空字符串游标等同于没有下一页
        let next = next.filter(|n| !n.is_empty());
        Self { items, next }
    }

    pub fn last(items: Vec<T>) -> Self {
        Self { items, next: None }
    }
}

/// 逐页拉取直到没有下一页或达到页数上限
pub async fn paginate<T, F, Fut>(
    platform: Platform,
    max_pages: u32,
    mut fetch: F,
) -> Result<Vec<T>, ConnectorError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>, ConnectorError>>,
{
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0u32;

    loop {
        let page = fetch(cursor.take()).await?;
        pages += 1;
        all.extend(page.items);

        match page.next {
            Some(next) if pages < max_pages => cursor = Some(next),
            Some(_) => {
                warn!(platform = %platform, pages, "Page limit reached, truncating listing");
                break;
            }
            None => break,
        }
    }

    Ok(all)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 3), Duration::from_millis(800));
        assert_eq!(backoff(base, 30), MAX_BACKOFF);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let base = Duration::from_millis(1000);
        for _ in 0..50 {
            let delay = with_jitter(base);
            assert!(delay >= base && delay <= Duration::from_millis(1200));
        }
        assert_eq!(with_jitter(Duration::from_millis(3)), Duration::from_millis(3));
    }

    #[test]
    fn test_redact_strips_tokens() {
        let body = r#"{"error":"invalid_auth","access_token":"ya29.abc","hint":"xoxb-123-456"}"#;
        let clean = redact(body);
        assert!(!clean.contains("ya29.abc"));
        assert!(!clean.contains("xoxb-123-456"));
        assert!(clean.contains("invalid_auth"));
        assert_eq!(redact("Bearer abc.def rejected"), "[REDACTED] rejected");
    }

    #[test]
    fn test_url_join() {
        let client = ApiClient::new(Platform::Slack, "https://slack.com/api/", HttpSettings::default())
            .unwrap();
        assert_eq!(client.url("/users.list"), "https://slack.com/api/users.list");
        assert_eq!(client.url("https://files.slack.com/x"), "https://files.slack.com/x");
    }

    #[tokio::test]
    async fn test_paginate_follows_cursor_until_exhausted() {
        let pages = vec![
            Page::new(vec![1, 2], Some("c1".to_string())),
            Page::new(vec![3], Some(String::new())),
        ];
        let mut pages = pages.into_iter();

        let all = paginate(Platform::Slack, 10, |_cursor| {
            let page = pages.next().unwrap_or_else(|| Page::last(vec![]));
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(all, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_paginate_respects_page_limit() {
        let mut calls = 0;
        let all = paginate(Platform::Jira, 3, |_cursor| {
            calls += 1;
            let n = calls;
            async move { Ok(Page::new(vec![n], Some(format!("c{}", n)))) }
        })
        .await
        .unwrap();

        assert_eq!(all, vec![1, 2, 3]);
    }
}
