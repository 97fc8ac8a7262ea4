//! 剧本处理器
//! 审批、驳回、执行与条目选择

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, Result};
use crate::middleware::{ActorId, AppState};
use crate::models::jobs::{JobEnvelope, JobEvent, PlaybookExecuteEvent};
use crate::models::playbook::{Playbook, PlaybookItem, PlaybookStatus, SelectItemRequest};

#[derive(Serialize)]
pub struct PlaybookDetail {
    #[serde(flatten)]
    pub playbook: Playbook,
    pub items: Vec<PlaybookItem>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub accepted: bool,
    pub event: &'static str,
}

async fn load(state: &AppState, id: Uuid) -> Result<Playbook> {
    state
        .stores
        .playbooks
        .get_playbook(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Playbook {}", id)))
}

pub async fn get_playbook(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let playbook = load(&state, id).await?;
    let items = state.stores.playbooks.list_items(id).await?;
    Ok(Json(PlaybookDetail { playbook, items }))
}

/// PENDING → APPROVED
pub async fn approve_playbook(
    State(state): State<Arc<AppState>>,
    actor: ActorId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    transition(&state, id, &[PlaybookStatus::Pending], PlaybookStatus::Approved, actor).await
}

/// PENDING | APPROVED → DISMISSED
pub async fn dismiss_playbook(
    State(state): State<Arc<AppState>>,
    actor: ActorId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    transition(
        &state,
        id,
        &[PlaybookStatus::Pending, PlaybookStatus::Approved],
        PlaybookStatus::Dismissed,
        actor,
    )
    .await
}

async fn transition(
    state: &AppState,
    id: Uuid,
    from: &[PlaybookStatus],
    to: PlaybookStatus,
    ActorId(actor): ActorId,
) -> Result<Json<Playbook>> {
    let current = load(state, id).await?;
    let changed = state
        .stores
        .playbooks
        .transition(id, from, to, Some(actor))
        .await?;
    if !changed {
        return Err(AppError::Conflict(format!(
            "Playbook {} is {}, cannot move to {}",
            id,
            current.status.as_str(),
            to.as_str()
        )));
    }
    tracing::info!(playbook_id = %id, actor = %actor, to = to.as_str(), "Playbook status changed");
    Ok(Json(load(state, id).await?))
}

/// 投递执行作业
pub async fn execute_playbook(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let playbook = load(&state, id).await?;
    if !matches!(playbook.status, PlaybookStatus::Pending | PlaybookStatus::Approved) {
        return Err(AppError::Conflict(format!(
            "Playbook {} is {} and cannot be executed",
            id,
            playbook.status.as_str()
        )));
    }

    let event = JobEvent::PlaybookExecute(PlaybookExecuteEvent {
        playbook_id: id,
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

/// 只有 PENDING / APPROVED 的剧本可以修改选择
pub async fn select_item(
    State(state): State<Arc<AppState>>,
    _actor: ActorId,
    Path((id, item_id)): Path<(Uuid, Uuid)>,
    Json(request): Json<SelectItemRequest>,
) -> Result<impl IntoResponse> {
    request
        .validate()
        .map_err(|e| AppError::Validation(e.to_string()))?;

    let playbook = load(&state, id).await?;
    if !matches!(playbook.status, PlaybookStatus::Pending | PlaybookStatus::Approved) {
        return Err(AppError::Conflict(format!(
            "Items of a {} playbook cannot be changed",
            playbook.status.as_str()
        )));
    }

    let found = state
        .stores
        .playbooks
        .set_item_selected(id, item_id, request.is_selected)
        .await?;
    if !found {
        return Err(AppError::NotFound(format!("Playbook item {}", item_id)));
    }
    Ok(StatusCode::NO_CONTENT)
}
