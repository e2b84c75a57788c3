use std::sync::Arc;

use axum::{routing::get, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use omniq_domain::TaskQueue;
use omniq_orchestrator::{MetricsHandle, ScalingOrchestrator};

use crate::handlers::{
    get_task, health, latest_metrics, list_allocations, prometheus_metrics, queue_stats,
    scaling_changes,
};

/// Shared read-only view over the running system. The API never mutates
/// queue or allocation state.
#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn TaskQueue>,
    pub metrics: MetricsHandle,
    pub orchestrator: Arc<ScalingOrchestrator>,
    pub prometheus: Option<PrometheusHandle>,
}

pub fn create_routes(state: AppState, cors_enabled: bool) -> Router {
    let mut router = Router::new()
        .route("/api/health", get(health))
        .route("/api/metrics", get(latest_metrics))
        .route("/api/allocations", get(list_allocations))
        .route("/api/scaling/changes", get(scaling_changes))
        .route("/api/tasks/{id}", get(get_task))
        .route("/api/queue/stats", get(queue_stats))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state);
    if cors_enabled {
        router = router.layer(CorsLayer::permissive());
    }
    router
}
