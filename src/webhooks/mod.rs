//! Webhook 接入
//!
//! 平台推送只作为同步提示：校验签名后投递 `integrations/sync`，不直接处理推送内容。

pub mod verify;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::{EventPublisher, JobError};
use crate::models::integration::Platform;
use crate::models::jobs::{IntegrationsSyncEvent, JobEnvelope, JobEvent};
use crate::repository::IntegrationStore;

pub use verify::{HmacVerifier, SlackVerifier, TokenVerifier, VerifierSet, WebhookVerifier};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Missing webhook signature")]
    MissingSignature,

    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Webhook timestamp outside the allowed window")]
    StaleTimestamp,

    #[error("No webhook secret configured for {0}")]
    NotConfigured(Platform),

    #[error("Unknown platform: {0}")]
    UnknownPlatform(String),

    #[error("Malformed webhook: {0}")]
    Malformed(String),

    #[error("Unknown integration: {0}")]
    UnknownIntegration(Uuid),

    #[error("Failed to enqueue sync: {0}")]
    Publish(#[from] JobError),

    #[error(transparent)]
    Persistence(#[from] AppError),
}

/// 规范化后的推送
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEnvelope {
    pub platform: Platform,
    pub event_type: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// 给平台的应答
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAck {
    pub accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge: Option<String>,
}

pub struct WebhookService {
    verifiers: VerifierSet,
    integrations: Arc<dyn IntegrationStore>,
    publisher: Arc<dyn EventPublisher>,
}

impl WebhookService {
    pub fn new(
        verifiers: VerifierSet,
        integrations: Arc<dyn IntegrationStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            verifiers,
            integrations,
            publisher,
        }
    }

    #[instrument(skip(self, headers, body), fields(platform = %platform, integration_id = %integration_id))]
    pub async fn handle(
        &self,
        platform: Platform,
        integration_id: Uuid,
        headers: &HeaderMap,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<WebhookAck, WebhookError> {
        self.verifiers.verify(platform, headers, body, now)?;

        let integration = self
            .integrations
            .get_integration(integration_id)
            .await?
            .filter(|i| i.is_active && i.platform == platform)
            .ok_or(WebhookError::UnknownIntegration(integration_id))?;

        let envelope = parse_envelope(platform, headers, body, now)?;

        // Slack 的 URL 验证只需回显 challenge
        if envelope.event_type == "url_verification" {
            let challenge = envelope
                .data
                .get("challenge")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            debug!("Answering URL verification challenge");
            return Ok(WebhookAck {
                accepted: true,
                challenge,
            });
        }

        self.publisher
            .publish(JobEnvelope::new(JobEvent::IntegrationsSync(IntegrationsSyncEvent {
                tenant_id: integration.tenant_id,
                user_id: None,
                source: Some(platform),
            })))
            .await?;

        info!(event_type = %envelope.event_type, "Webhook accepted, sync requested");
        Ok(WebhookAck {
            accepted: true,
            challenge: None,
        })
    }
}

/// 提取事件类型；Google 推送没有正文，事件类型在头里
pub fn parse_envelope(
    platform: Platform,
    headers: &HeaderMap,
    body: &[u8],
    now: DateTime<Utc>,
) -> Result<WebhookEnvelope, WebhookError> {
    let data: serde_json::Value = if body.iter().all(|b| b.is_ascii_whitespace()) {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?
    };

    let from_header = headers
        .get("x-goog-resource-state")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let from_body = ["event_type", "type", "webhookEvent"]
        .iter()
        .find_map(|key| data.get(*key).and_then(|v| v.as_str()))
        .map(str::to_string);

    let event_type = from_header
        .or(from_body)
        .unwrap_or_else(|| "unknown".to_string());

    Ok(WebhookEnvelope {
        platform,
        event_type,
        data,
        timestamp: now,
    })
}
