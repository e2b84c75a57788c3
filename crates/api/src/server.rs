use tokio_util::sync::CancellationToken;
use tracing::info;

use omniq_core::config::ApiConfig;
use omniq_core::errors::{OmniqError, OmniqResult};

use crate::routes::{create_routes, AppState};

/// Binds and serves the read-only API until the shutdown token fires.
pub async fn serve(
    state: AppState,
    config: &ApiConfig,
    shutdown: CancellationToken,
) -> OmniqResult<()> {
    let listener = tokio::net::TcpListener::bind(&config.bind_address)
        .await
        .map_err(|e| {
            OmniqError::config(format!("failed to bind {}: {e}", config.bind_address))
        })?;
    info!(address = %config.bind_address, "api server listening");

    let router = create_routes(state, config.cors_enabled);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| OmniqError::Internal(format!("api server failed: {e}")))
}
