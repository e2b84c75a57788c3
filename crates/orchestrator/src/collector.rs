use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use omniq_core::config::OrchestratorConfig;
use omniq_domain::{MetricsSnapshot, TaskOutcome, TaskQueue, WorkerEvent};
use omniq_worker::{EventSink, WorkerPool};

fn rolling_window() -> chrono::Duration {
    chrono::Duration::hours(1)
}

/// Read side of the collector: the latest snapshot plus bounded history.
#[derive(Clone)]
pub struct MetricsHandle {
    rx: watch::Receiver<Arc<MetricsSnapshot>>,
    history: Arc<Mutex<VecDeque<Arc<MetricsSnapshot>>>>,
}

impl MetricsHandle {
    pub fn latest(&self) -> Arc<MetricsSnapshot> {
        self.rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<MetricsSnapshot>> {
        self.rx.clone()
    }

    pub fn history(&self) -> Vec<Arc<MetricsSnapshot>> {
        match self.history.lock() {
            Ok(history) => history.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Single consumer of worker events. Keeps a one-hour rolling window,
/// samples queue depths on every tick and publishes an immutable snapshot
/// for the orchestrator and the API.
pub struct MetricsCollector {
    queue: Arc<dyn TaskQueue>,
    pool: Arc<WorkerPool>,
    events: mpsc::Receiver<WorkerEvent>,
    sink: EventSink,
    interval: Duration,
    compliance_kind: String,
    history_limit: usize,
    window: VecDeque<WorkerEvent>,
    tx: watch::Sender<Arc<MetricsSnapshot>>,
    history: Arc<Mutex<VecDeque<Arc<MetricsSnapshot>>>>,
}

impl MetricsCollector {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        pool: Arc<WorkerPool>,
        events: mpsc::Receiver<WorkerEvent>,
        sink: EventSink,
        config: &OrchestratorConfig,
    ) -> (Self, MetricsHandle) {
        let (tx, rx) = watch::channel(Arc::new(MetricsSnapshot::default()));
        let history = Arc::new(Mutex::new(VecDeque::new()));
        let handle = MetricsHandle {
            rx,
            history: Arc::clone(&history),
        };
        (
            Self {
                queue,
                pool,
                events,
                sink,
                interval: Duration::from_secs(config.evaluation_interval_seconds),
                compliance_kind: config.compliance_kind.clone(),
                history_limit: config.history_limit,
                window: VecDeque::new(),
                tx,
                history,
            },
            handle,
        )
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut events_open = true;
        loop {
            enum Step {
                Event(Option<WorkerEvent>),
                Capture,
            }
            let step = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = self.events.recv(), if events_open => Step::Event(event),
                _ = ticker.tick() => Step::Capture,
            };
            match step {
                Step::Event(Some(event)) => self.window.push_back(event),
                Step::Event(None) => events_open = false,
                Step::Capture => {
                    if let Err(e) = self.capture().await {
                        warn!(error = %e, "metrics capture failed");
                    }
                }
            }
        }
        debug!("metrics collector stopped");
    }

    /// Builds and publishes one snapshot. Also drives the process-level
    /// gauges so the Prometheus endpoint mirrors what the orchestrator sees.
    pub async fn capture(&mut self) -> omniq_core::OmniqResult<()> {
        let now = Utc::now();
        self.prune(now);

        let stats = self.queue.stats().await?;
        let mut snapshot = MetricsSnapshot {
            captured_at: Some(now),
            queue_backend: stats.backend.clone(),
            depth_by_priority: stats.pending_by_priority.clone(),
            depth_by_tenant: stats.pending_by_tenant.clone(),
            events_dropped: self.sink.dropped_count(),
            active_workers: self.pool.total_workers(),
            ..Default::default()
        };

        let mut wait_total = 0u64;
        let mut run_total = 0u64;
        let mut finished = 0u64;
        let mut compliance_total = 0u64;
        let mut compliance_passed = 0u64;
        for event in &self.window {
            finished += 1;
            wait_total += event.wait_ms;
            run_total += event.run_ms;
            if event.timed_out {
                snapshot.timed_out_last_hour += 1;
            }
            match event.outcome {
                TaskOutcome::Completed => {
                    snapshot.completed_last_hour += 1;
                    if event.kind == self.compliance_kind {
                        compliance_total += 1;
                        let passed = event
                            .result
                            .as_ref()
                            .and_then(|r| r.get("passed"))
                            .and_then(|p| p.as_bool())
                            .unwrap_or(false);
                        if passed {
                            compliance_passed += 1;
                        }
                    }
                }
                TaskOutcome::Retried => snapshot.retried_last_hour += 1,
                TaskOutcome::DeadLettered => snapshot.dead_lettered_last_hour += 1,
            }
        }
        if finished > 0 {
            snapshot.avg_wait_ms = wait_total as f64 / finished as f64;
            snapshot.avg_run_ms = run_total as f64 / finished as f64;
        }
        if compliance_total > 0 {
            snapshot.compliance_pass_rate =
                Some(compliance_passed as f64 / compliance_total as f64);
        }
        snapshot.throughput_per_hour = snapshot.completed_last_hour as f64;

        for (priority, depth) in &snapshot.depth_by_priority {
            metrics::gauge!("omniq_queue_depth", "priority" => priority.as_str())
                .set(*depth as f64);
        }
        metrics::gauge!("omniq_active_workers").set(snapshot.active_workers as f64);
        metrics::gauge!("omniq_throughput_per_hour").set(snapshot.throughput_per_hour);

        let snapshot = Arc::new(snapshot);
        if let Ok(mut history) = self.history.lock() {
            history.push_back(Arc::clone(&snapshot));
            while history.len() > self.history_limit {
                history.pop_front();
            }
        }
        let _ = self.tx.send(snapshot);
        Ok(())
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - rolling_window();
        while let Some(front) = self.window.front() {
            if front.finished_at >= cutoff {
                break;
            }
            self.window.pop_front();
        }
    }

    /// Drains whatever events are already buffered without waiting. Lets
    /// tests and one-shot captures see recent outcomes immediately.
    pub fn absorb_pending(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.window.push_back(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use omniq_core::config::{QueueConfig, WorkerPoolConfig};
    use omniq_domain::{
        ExecutionError, Task, TaskContext, TaskDefinition, TaskHandler, TaskPriority, TaskRegistry,
        TaskSubmission,
    };
    use omniq_queue::FallbackQueue;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute(
            &self,
            _task: &Task,
            _ctx: &TaskContext,
        ) -> Result<serde_json::Value, ExecutionError> {
            Ok(serde_json::json!({}))
        }
    }

    fn event(kind: &str, outcome: TaskOutcome, result: Option<serde_json::Value>) -> WorkerEvent {
        WorkerEvent {
            task_id: "t".to_string(),
            tenant_id: "alpha".to_string(),
            kind: kind.to_string(),
            priority: TaskPriority::Medium,
            outcome,
            wait_ms: 100,
            run_ms: 50,
            timed_out: false,
            finished_at: Utc::now(),
            result,
        }
    }

    fn collector() -> (MetricsCollector, MetricsHandle, EventSink, Arc<FallbackQueue>) {
        let registry = TaskRegistry::new();
        registry
            .register(
                TaskDefinition {
                    kind: "compliance_check".to_string(),
                    default_priority: TaskPriority::High,
                    timeout_seconds: 30,
                    max_attempts: 1,
                },
                Arc::new(NoopHandler),
            )
            .unwrap();
        let registry = Arc::new(registry);
        let queue = Arc::new(FallbackQueue::new(
            Arc::clone(&registry),
            &QueueConfig::default(),
        ));
        let (sink, rx) = EventSink::channel(64);
        let pool = Arc::new(WorkerPool::new(
            queue.clone() as Arc<dyn TaskQueue>,
            registry,
            sink.clone(),
            WorkerPoolConfig::default(),
        ));
        let (collector, handle) = MetricsCollector::new(
            queue.clone() as Arc<dyn TaskQueue>,
            pool,
            rx,
            sink.clone(),
            &OrchestratorConfig::default(),
        );
        (collector, handle, sink, queue)
    }

    #[tokio::test]
    async fn snapshot_aggregates_window_and_depths() {
        let (mut collector, handle, sink, queue) = collector();
        queue
            .enqueue(TaskSubmission {
                kind: "compliance_check".to_string(),
                tenant_id: "alpha".to_string(),
                priority: TaskPriority::High,
                payload: serde_json::json!({}),
            })
            .await
            .unwrap();

        sink.emit(event(
            "compliance_check",
            TaskOutcome::Completed,
            Some(serde_json::json!({"passed": true})),
        ));
        sink.emit(event(
            "compliance_check",
            TaskOutcome::Completed,
            Some(serde_json::json!({"passed": false})),
        ));
        sink.emit(event("other", TaskOutcome::Retried, None));

        collector.absorb_pending();
        collector.capture().await.unwrap();

        let snap = handle.latest();
        assert_eq!(snap.completed_last_hour, 2);
        assert_eq!(snap.retried_last_hour, 1);
        assert_eq!(snap.compliance_pass_rate, Some(0.5));
        assert_eq!(snap.tenant_depth("alpha"), 1);
        assert_eq!(snap.queue_backend, "fallback");
        assert_eq!(handle.history().len(), 1);
    }

    #[tokio::test]
    async fn old_events_age_out_of_the_window() {
        let (mut collector, handle, sink, _queue) = collector();
        let mut stale = event("other", TaskOutcome::Completed, None);
        stale.finished_at = Utc::now() - chrono::Duration::hours(2);
        sink.emit(stale);
        sink.emit(event("other", TaskOutcome::Completed, None));

        collector.absorb_pending();
        collector.capture().await.unwrap();
        assert_eq!(handle.latest().completed_last_hour, 1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let (mut collector, handle, _sink, _queue) = collector();
        collector.history_limit = 3;
        for _ in 0..5 {
            collector.capture().await.unwrap();
        }
        assert_eq!(handle.history().len(), 3);
    }
}
