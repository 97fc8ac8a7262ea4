//! 撤销处理器

use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::middleware::{ActorId, AppState};

pub async fn get_entry(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let entry = state
        .stores
        .audit_logs
        .get_entry(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Audit log entry {}", id)))?;
    Ok(Json(entry))
}

/// 撤销整条记录
pub async fn undo_entry(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let report = state.undo.undo_entry(id, actor).await?;
    Ok(Json(report))
}

/// 撤销单个动作
pub async fn undo_action(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path((id, index)): Path<(Uuid, usize)>,
) -> Result<impl IntoResponse> {
    let report = state.undo.undo_action(id, index, actor).await?;
    Ok(Json(report))
}
