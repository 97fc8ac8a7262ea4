//! 调度器事件入口
//!
//! 外部调度器把事件 POST 到这里并同步等待结果；非 2xx 的应答由调度器按自身策略重投，
//! 幂等键保证重投只补做未完成的步骤。

use axum::{extract::State, response::IntoResponse, Json};
use std::sync::Arc;

use crate::error::Result;
use crate::middleware::AppState;
use crate::models::jobs::JobEnvelope;

pub async fn receive_event(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<JobEnvelope>,
) -> Result<impl IntoResponse> {
    let outcome = state.dispatcher.dispatch(&envelope).await?;
    Ok(Json(outcome))
}
