//! 平台 webhook 入口

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;
use crate::middleware::AppState;
use crate::models::integration::Platform;
use crate::webhooks::WebhookError;

pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path((platform, integration_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse> {
    let platform: Platform = platform
        .parse()
        .map_err(|_| WebhookError::UnknownPlatform(platform.clone()))?;

    let ack = state
        .webhooks
        .handle(platform, integration_id, &headers, &body, Utc::now())
        .await?;
    Ok(Json(ack))
}
