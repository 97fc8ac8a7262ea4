//! 审计处理器

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use super::playbooks::Accepted;
use crate::error::{AppError, Result};
use crate::middleware::{ActorId, AppState};
use crate::models::jobs::{AuditRunEvent, JobEnvelope, JobEvent};

/// 投递审计作业
pub async fn trigger_audit(
    State(state): State<Arc<AppState>>,
    ActorId(actor): ActorId,
    Path(tenant_id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    state
        .stores
        .tenants
        .get_tenant(tenant_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Tenant {}", tenant_id)))?;

    let event = JobEvent::AuditRun(AuditRunEvent {
        tenant_id,
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

pub async fn get_audit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse> {
    let result = state
        .stores
        .audits
        .get_audit_result(id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("Audit result {}", id)))?;
    Ok(Json(result))
}
