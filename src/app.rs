use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use omniq_api::AppState;
use omniq_core::config::{AppConfig, ChannelConfig, ChannelConfigStore};
use omniq_domain::{TaskDefinition, TaskPriority, TaskQueue, TaskRegistry};
use omniq_orchestrator::{MetricsCollector, MetricsHandle, ScalingOrchestrator};
use omniq_queue::QueueFactory;
use omniq_worker::{EventSink, HttpCallHandler, WorkerPool};

/// Fully wired service: queue, worker pool, metrics collector, scaling
/// orchestrator and the read-only API.
pub struct Application {
    config: AppConfig,
    queue: Arc<dyn TaskQueue>,
    pool: Arc<WorkerPool>,
    collector: MetricsCollector,
    metrics: MetricsHandle,
    orchestrator: Arc<ScalingOrchestrator>,
    prometheus: Option<PrometheusHandle>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let channels = load_channels(&config)?;
        info!(tenants = channels.len(), "channel configuration loaded");

        let registry = build_registry(&config)?;
        info!(kinds = ?registry.kinds(), "task registry ready");

        let queue = QueueFactory::create(Arc::clone(&registry), &config.queue)
            .await
            .context("failed to create task queue")?;

        let (sink, events) = EventSink::channel(config.worker.event_buffer_size);
        let pool = Arc::new(WorkerPool::new(
            Arc::clone(&queue),
            registry,
            sink.clone(),
            config.worker.clone(),
        ));

        let (collector, metrics) = MetricsCollector::new(
            Arc::clone(&queue),
            Arc::clone(&pool),
            events,
            sink,
            &config.orchestrator,
        );

        let orchestrator = Arc::new(
            ScalingOrchestrator::new(
                Arc::clone(&pool),
                metrics.subscribe(),
                &channels,
                config.orchestrator.clone(),
            )
            .context("failed to build scaling orchestrator")?,
        );

        let prometheus = if config.observability.metrics_enabled {
            Some(
                PrometheusBuilder::new()
                    .install_recorder()
                    .context("failed to install metrics recorder")?,
            )
        } else {
            None
        };

        Ok(Self {
            config,
            queue,
            pool,
            collector,
            metrics,
            orchestrator,
            prometheus,
        })
    }

    /// Runs every component until the token fires, then drains the pool.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        self.orchestrator
            .apply_minimums()
            .context("failed to start worker minimums")?;
        info!(
            workers = self.pool.total_workers(),
            backend = self.queue.backend_name(),
            strategy = self.orchestrator.strategy_name(),
            "service started"
        );

        let collector_handle = tokio::spawn(self.collector.run(shutdown.clone()));
        let orchestrator_handle =
            tokio::spawn(Arc::clone(&self.orchestrator).run(shutdown.clone()));

        let api_handle = if self.config.api.enabled {
            let state = AppState {
                queue: Arc::clone(&self.queue),
                metrics: self.metrics.clone(),
                orchestrator: Arc::clone(&self.orchestrator),
                prometheus: self.prometheus.clone(),
            };
            let api_config = self.config.api.clone();
            let api_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = omniq_api::serve(state, &api_config, api_shutdown).await {
                    error!(error = %e, "api server exited with error");
                }
            }))
        } else {
            None
        };

        shutdown.cancelled().await;
        info!("draining worker pool");
        self.pool.shutdown().await;

        for handle in [Some(collector_handle), Some(orchestrator_handle), api_handle]
            .into_iter()
            .flatten()
        {
            if tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .is_err()
            {
                warn!("component did not stop in time");
            }
        }
        Ok(())
    }
}

fn load_channels(config: &AppConfig) -> Result<Vec<ChannelConfig>> {
    if !Path::new(&config.channels_dir).is_dir() {
        warn!(
            directory = %config.channels_dir,
            "channels directory not found, starting without tenants"
        );
        return Ok(Vec::new());
    }
    let store = ChannelConfigStore::load(&config.channels_dir)
        .context("failed to load channel configuration")?;
    Ok(store.channels().to_vec())
}

fn build_registry(config: &AppConfig) -> Result<Arc<TaskRegistry>> {
    let registry = TaskRegistry::new();
    for kind in &config.task_kinds {
        let handler = HttpCallHandler::new(
            kind.endpoint.clone(),
            Duration::from_secs(kind.timeout_seconds),
        )
        .with_context(|| format!("failed to build handler for task kind {}", kind.kind))?;
        registry.register(
            TaskDefinition {
                kind: kind.kind.clone(),
                default_priority: TaskPriority::parse(&kind.default_priority)?,
                timeout_seconds: kind.timeout_seconds,
                max_attempts: kind.max_attempts,
            },
            Arc::new(handler),
        )?;
    }
    Ok(Arc::new(registry))
}
