//! 各平台的 webhook 签名校验

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, Secret};
use sha2::Sha256;
use std::collections::HashMap;

use super::WebhookError;
use crate::config::WebhookConfig;
use crate::models::integration::Platform;

type HmacSha256 = Hmac<Sha256>;

pub trait WebhookVerifier: Send + Sync {
    fn verify(&self, headers: &HeaderMap, body: &[u8], now: DateTime<Utc>) -> Result<(), WebhookError>;
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn mac(secret: &Secret<String>) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|_| WebhookError::Malformed("invalid signing secret".to_string()))
}

fn verify_hex(mac: HmacSha256, signature_hex: &str) -> Result<(), WebhookError> {
    let expected = hex::decode(signature_hex.trim()).map_err(|_| WebhookError::InvalidSignature)?;
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// Slack：`v0=` + HMAC(`v0:{ts}:{body}`)，并检查时间戳偏差
pub struct SlackVerifier {
    secret: Secret<String>,
    max_skew_secs: i64,
}

impl SlackVerifier {
    pub fn new(secret: Secret<String>, max_skew_secs: i64) -> Self {
        Self {
            secret,
            max_skew_secs,
        }
    }
}

impl WebhookVerifier for SlackVerifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8], now: DateTime<Utc>) -> Result<(), WebhookError> {
        let signature = header(headers, "x-slack-signature").ok_or(WebhookError::MissingSignature)?;
        let timestamp = header(headers, "x-slack-request-timestamp").ok_or(WebhookError::MissingSignature)?;

        let ts: i64 = timestamp
            .trim()
            .parse()
            .map_err(|_| WebhookError::Malformed("invalid request timestamp".to_string()))?;
        if (now.timestamp() - ts).abs() > self.max_skew_secs {
            return Err(WebhookError::StaleTimestamp);
        }

        let signature_hex = signature
            .strip_prefix("v0=")
            .ok_or(WebhookError::InvalidSignature)?;

        let mut mac = mac(&self.secret)?;
        mac.update(b"v0:");
        mac.update(timestamp.trim().as_bytes());
        mac.update(b":");
        mac.update(body);
        verify_hex(mac, signature_hex)
    }
}

/// Google 推送通道：比对 X-Goog-Channel-Token
pub struct TokenVerifier {
    token: Secret<String>,
}

impl TokenVerifier {
    pub fn new(token: Secret<String>) -> Self {
        Self { token }
    }
}

impl WebhookVerifier for TokenVerifier {
    fn verify(&self, headers: &HeaderMap, _body: &[u8], _now: DateTime<Utc>) -> Result<(), WebhookError> {
        let provided = header(headers, "x-goog-channel-token").ok_or(WebhookError::MissingSignature)?;
        if constant_time_eq(provided.as_bytes(), self.token.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

/// 通用 `sha256=<hex>` 签名（Figma / Jira / Notion）
pub struct HmacVerifier {
    header: &'static str,
    secret: Secret<String>,
}

impl HmacVerifier {
    pub fn new(header: &'static str, secret: Secret<String>) -> Self {
        Self { header, secret }
    }
}

impl WebhookVerifier for HmacVerifier {
    fn verify(&self, headers: &HeaderMap, body: &[u8], _now: DateTime<Utc>) -> Result<(), WebhookError> {
        let signature = header(headers, self.header).ok_or(WebhookError::MissingSignature)?;
        let signature_hex = signature.strip_prefix("sha256=").unwrap_or(signature);

        let mut mac = mac(&self.secret)?;
        mac.update(body);
        verify_hex(mac, signature_hex)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// 按平台索引的校验器
#[derive(Default)]
pub struct VerifierSet {
    verifiers: HashMap<Platform, Box<dyn WebhookVerifier>>,
}

impl VerifierSet {
    pub fn from_config(config: &WebhookConfig) -> Self {
        let mut set = Self::default();
        if let Some(secret) = &config.slack_signing_secret {
            set.insert(
                Platform::Slack,
                SlackVerifier::new(secret.clone(), config.max_clock_skew_secs),
            );
        }
        if let Some(token) = &config.google_channel_token {
            set.insert(Platform::GoogleWorkspace, TokenVerifier::new(token.clone()));
        }
        if let Some(secret) = &config.figma_passcode {
            set.insert(Platform::Figma, HmacVerifier::new("x-figma-signature", secret.clone()));
        }
        if let Some(secret) = &config.jira_secret {
            set.insert(Platform::Jira, HmacVerifier::new("x-hub-signature", secret.clone()));
        }
        if let Some(secret) = &config.notion_secret {
            set.insert(Platform::Notion, HmacVerifier::new("x-notion-signature", secret.clone()));
        }
        set
    }

    pub fn insert(&mut self, platform: Platform, verifier: impl WebhookVerifier + 'static) {
        self.verifiers.insert(platform, Box::new(verifier));
    }

    /// 没有配置密钥的平台一律拒绝
    pub fn verify(
        &self,
        platform: Platform,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let verifier = self
            .verifiers
            .get(&platform)
            .ok_or(WebhookError::NotConfigured(platform))?;
        verifier.verify(headers, body, now)
    }
}

/// 生成 Slack 风格签名
pub fn slack_signature(secret: &str, timestamp: i64, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = mac(&Secret::new(secret.to_string()))?;
    mac.update(format!("v0:{}:", timestamp).as_bytes());
    mac.update(body);
    Ok(format!("v0={}", hex::encode(mac.finalize().into_bytes())))
}

/// 生成 `sha256=` 签名
pub fn hmac_signature(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = mac(&Secret::new(secret.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn slack_headers(signature: &str, ts: i64) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert("x-slack-signature", HeaderValue::from_str(signature).unwrap());
        headers.insert(
            "x-slack-request-timestamp",
            HeaderValue::from_str(&ts.to_string()).unwrap(),
        );
        headers
    }

    #[test]
    fn test_slack_signature_accepts_valid_request() {
        let now = Utc::now();
        let body = br#"{"type":"event_callback"}"#;
        let verifier = SlackVerifier::new(Secret::new("shh".to_string()), 300);
        let headers = slack_headers(&slack_signature("shh", now.timestamp(), body).unwrap(), now.timestamp());
        assert!(verifier.verify(&headers, body, now).is_ok());
    }

    #[test]
    fn test_slack_signature_rejects_tampered_body() {
        let now = Utc::now();
        let verifier = SlackVerifier::new(Secret::new("shh".to_string()), 300);
        let headers = slack_headers(&slack_signature("shh", now.timestamp(), b"a").unwrap(), now.timestamp());
        assert!(matches!(
            verifier.verify(&headers, b"b", now),
            Err(WebhookError::InvalidSignature)
        ));
    }

    #[test]
    fn test_slack_rejects_stale_timestamp() {
        let now = Utc::now();
        let ts = now.timestamp() - 600;
        let verifier = SlackVerifier::new(Secret::new("shh".to_string()), 300);
        let headers = slack_headers(&slack_signature("shh", ts, b"{}").unwrap(), ts);
        assert!(matches!(
            verifier.verify(&headers, b"{}", now),
            Err(WebhookError::StaleTimestamp)
        ));
    }

    #[test]
    fn test_hmac_verifier() {
        let verifier = HmacVerifier::new("x-hub-signature", Secret::new("k".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-hub-signature",
            HeaderValue::from_str(&hmac_signature("k", b"payload").unwrap()).unwrap(),
        );
        assert!(verifier.verify(&headers, b"payload", Utc::now()).is_ok());
        assert!(verifier.verify(&HeaderMap::new(), b"payload", Utc::now()).is_err());
    }

    #[test]
    fn test_unconfigured_platform_rejected() {
        let set = VerifierSet::default();
        let err = set
            .verify(Platform::Notion, &HeaderMap::new(), b"{}", Utc::now())
            .unwrap_err();
        assert!(matches!(err, WebhookError::NotConfigured(Platform::Notion)));
    }
}
