//! 归档处理器

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use super::playbooks::Accepted;
use crate::error::{AppError, Result};
use crate::middleware::{ActorId, AppState};
use crate::models::archive::RestoreArchiveRequest;
use crate::models::jobs::{ArchiveBatchEvent, JobEnvelope, JobEvent};

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct BatchRequest {
    pub tenant_id: Uuid,
    /// 单次批量最多 500 条
    #[validate(length(min = 1, max = 500))]
    pub archive_ids: Vec<Uuid>,
}

pub async fn get_archive(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    Ok(Json(state.archives.get(id).await?))
}

/// 推回源平台
pub async fn restore_archive(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
    Json(request): Json<RestoreArchiveRequest>,
) -> Result<impl IntoResponse> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let now = Utc::now();
    let archive = state.archives.get(id).await?;
    let connector = state
        .tokens
        .connector_for_platform(archive.tenant_id, archive.platform, now)
        .await?;
    let restored = state
        .archives
        .restore_via(id, request.target_location, connector.as_ref(), now)
        .await?;

    tracing::info!(archive_id = %id, actor = %actor, "Archive restored on request");
    Ok(Json(restored))
}

pub async fn batch_restore(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse> {
    enqueue_batch(&state, actor, request, JobEvent::ArchiveBatchRestore).await
}

pub async fn batch_delete(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Json(request): Json<BatchRequest>,
) -> Result<impl IntoResponse> {
    enqueue_batch(&state, actor, request, JobEvent::ArchiveBatchDelete).await
}

async fn enqueue_batch(
    state: &AppState,
    actor: Uuid,
    request: BatchRequest,
    wrap: fn(ArchiveBatchEvent) -> JobEvent,
) -> Result<(StatusCode, Json<Accepted>)> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let event = wrap(ArchiveBatchEvent {
        archive_ids: request.archive_ids,
        tenant_id: request.tenant_id,
        user_id: actor,
    });
    let name = event.name();
    state.publisher.publish(JobEnvelope::new(event)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            accepted: true,
            event: name,
        }),
    ))
}

/// 归档存储健康状况
pub async fn archive_health(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse> {
    Ok(Json(state.archives.health_check(Utc::now()).await?))
}
