use axum::extract::{Path, State};
use axum::Json;
use serde_json::{json, Value};

use omniq_domain::{MetricsSnapshot, QueueStats, ScalingChange, Task, TenantAllocation};

use crate::response::{ApiError, ApiResponse};
use crate::routes::AppState;

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "omniq",
        "version": env!("CARGO_PKG_VERSION"),
        "queue_backend": state.queue.backend_name(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

pub async fn latest_metrics(
    State(state): State<AppState>,
) -> Json<ApiResponse<MetricsSnapshot>> {
    let snapshot = state.metrics.latest();
    Json(ApiResponse::success(MetricsSnapshot::clone(&snapshot)))
}

pub async fn list_allocations(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<TenantAllocation>>> {
    Json(ApiResponse::success(state.orchestrator.allocations()))
}

pub async fn scaling_changes(
    State(state): State<AppState>,
) -> Json<ApiResponse<Vec<ScalingChange>>> {
    Json(ApiResponse::success(state.orchestrator.changes()))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<Task>>, ApiError> {
    match state.queue.get_task(&id).await? {
        Some(task) => Ok(Json(ApiResponse::success(task))),
        None => Err(ApiError::not_found(format!("task not found: {id}"))),
    }
}

pub async fn queue_stats(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<QueueStats>>, ApiError> {
    Ok(Json(ApiResponse::success(state.queue.stats().await?)))
}

/// Prometheus text exposition. Empty when no recorder was installed.
pub async fn prometheus_metrics(State(state): State<AppState>) -> String {
    state
        .prometheus
        .as_ref()
        .map(|handle| handle.render())
        .unwrap_or_default()
}
