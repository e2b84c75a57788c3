use std::sync::Arc;

use url::Url;

use omniq_core::config::QueueConfig;
use omniq_core::errors::{OmniqError, OmniqResult};
use omniq_domain::{TaskQueue, TaskRegistry};

use crate::broker::RedisBrokerQueue;
use crate::fallback::FallbackQueue;

/// Picks the queue backend once at startup. A configured broker is tried
/// first; if it cannot be reached within the connect timeout the in-process
/// fallback takes over for the life of the process.
pub struct QueueFactory;

impl QueueFactory {
    pub fn validate_config(config: &QueueConfig) -> OmniqResult<()> {
        if let Some(url) = config.broker_url.as_deref().filter(|u| !u.is_empty()) {
            let parsed = Url::parse(url)
                .map_err(|e| OmniqError::config(format!("invalid broker URL: {e}")))?;
            if !matches!(parsed.scheme(), "redis" | "rediss") {
                return Err(OmniqError::config(format!(
                    "unsupported broker scheme: {}",
                    parsed.scheme()
                )));
            }
            if parsed.host_str().is_none() {
                return Err(OmniqError::config("broker URL is missing a host"));
            }
        }
        if config.fallback_max_pending == 0 {
            return Err(OmniqError::config(
                "queue.fallback_max_pending must be positive",
            ));
        }
        Ok(())
    }

    pub async fn create(
        registry: Arc<TaskRegistry>,
        config: &QueueConfig,
    ) -> OmniqResult<Arc<dyn TaskQueue>> {
        Self::validate_config(config)?;

        if config.broker_url.as_deref().is_some_and(|u| !u.is_empty()) {
            match RedisBrokerQueue::connect(Arc::clone(&registry), config).await {
                Ok(queue) => {
                    tracing::info!("queue backend: broker");
                    return Ok(Arc::new(queue));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker unreachable, using fallback queue");
                }
            }
        } else {
            tracing::info!("no broker configured, using fallback queue");
        }

        Ok(Arc::new(FallbackQueue::new(registry, config)))
    }
}
