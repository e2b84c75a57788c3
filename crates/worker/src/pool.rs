use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use omniq_core::config::WorkerPoolConfig;
use omniq_core::errors::{OmniqError, OmniqResult};
use omniq_domain::{TaskPriority, TaskQueue, TaskRegistry};

use crate::events::EventSink;
use crate::execution::{run_unit, UnitContext};

struct UnitHandle {
    retire: watch::Sender<bool>,
    join: JoinHandle<()>,
}

/// Pool of execution units, grouped by `(tenant, priority class)`. The
/// orchestrator resizes groups through `set_worker_count`; a hard global
/// ceiling bounds the sum of all groups.
pub struct WorkerPool {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<TaskRegistry>,
    sink: EventSink,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    host: String,
    seq: AtomicU64,
    units: Mutex<HashMap<(String, TaskPriority), Vec<UnitHandle>>>,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        registry: Arc<TaskRegistry>,
        sink: EventSink,
        config: WorkerPoolConfig,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string());
        Self {
            queue,
            registry,
            sink,
            config,
            shutdown: CancellationToken::new(),
            host,
            seq: AtomicU64::new(0),
            units: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> OmniqResult<MutexGuard<'_, HashMap<(String, TaskPriority), Vec<UnitHandle>>>> {
        self.units
            .lock()
            .map_err(|_| OmniqError::Internal("worker pool lock poisoned".to_string()))
    }

    /// Resizes one tenant/class group to `desired` units. Growth beyond the
    /// global ceiling is refused; shrink retires units cooperatively, each
    /// finishing its in-flight task first.
    pub fn set_worker_count(
        &self,
        tenant: &str,
        priority_class: TaskPriority,
        desired: u32,
    ) -> OmniqResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(OmniqError::Internal(
                "worker pool is shut down".to_string(),
            ));
        }
        let mut units = self.lock()?;
        let total: usize = units.values().map(Vec::len).sum();
        let group = units
            .entry((tenant.to_string(), priority_class))
            .or_default();
        let current = group.len();
        let desired = desired as usize;

        if desired > current {
            let growth = desired - current;
            if total + growth > self.config.global_ceiling as usize {
                return Err(OmniqError::ResourceExhausted(format!(
                    "worker ceiling reached: {total} live, {growth} requested, ceiling {}",
                    self.config.global_ceiling
                )));
            }
            for _ in 0..growth {
                let seq = self.seq.fetch_add(1, Ordering::Relaxed);
                let id = format!("{}:{tenant}:{priority_class}:{seq}", self.host);
                let (retire_tx, retire_rx) = watch::channel(false);
                let ctx = UnitContext {
                    id,
                    tenant_id: tenant.to_string(),
                    priority_class,
                    queue: Arc::clone(&self.queue),
                    registry: Arc::clone(&self.registry),
                    sink: self.sink.clone(),
                    dequeue_timeout: Duration::from_millis(self.config.dequeue_timeout_ms),
                    idle_backoff: Duration::from_millis(self.config.idle_backoff_ms),
                    shutdown: self.shutdown.clone(),
                    retire: retire_rx,
                };
                group.push(UnitHandle {
                    retire: retire_tx,
                    join: tokio::spawn(run_unit(ctx)),
                });
            }
        } else {
            while group.len() > desired {
                if let Some(handle) = group.pop() {
                    if handle.retire.send(true).is_err() {
                        warn!(tenant, "retired unit was already gone");
                    }
                }
            }
        }

        if current != desired {
            info!(
                tenant,
                class = %priority_class,
                from = current,
                to = desired,
                "worker group resized"
            );
        }
        Ok(())
    }

    pub fn worker_count(&self, tenant: &str, priority_class: TaskPriority) -> u32 {
        self.lock()
            .ok()
            .and_then(|units| {
                units
                    .get(&(tenant.to_string(), priority_class))
                    .map(|g| g.len() as u32)
            })
            .unwrap_or(0)
    }

    pub fn total_workers(&self) -> u32 {
        self.lock()
            .map(|units| units.values().map(Vec::len).sum::<usize>() as u32)
            .unwrap_or(0)
    }

    pub fn global_ceiling(&self) -> u32 {
        self.config.global_ceiling
    }

    /// Stops all units and waits for in-flight attempts to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<UnitHandle> = match self.lock() {
            Ok(mut units) => units.drain().flat_map(|(_, group)| group).collect(),
            Err(_) => return,
        };
        for handle in handles {
            if let Err(e) = handle.join.await {
                warn!(error = %e, "execution unit join failed");
            }
        }
        info!("worker pool stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use omniq_core::config::QueueConfig;
    use omniq_domain::{
        ExecutionError, Task, TaskContext, TaskDefinition, TaskHandler, TaskOutcome, TaskStatus,
        TaskSubmission,
    };
    use omniq_queue::FallbackQueue;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    struct ScriptedHandler {
        calls: Arc<AtomicU32>,
        cancels: Arc<AtomicU32>,
        behavior: Behavior,
    }

    enum Behavior {
        Succeed(serde_json::Value),
        FailTransient,
        Hang,
        HangUntilCancelled,
        Panic,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn execute(
            &self,
            _task: &Task,
            ctx: &TaskContext,
        ) -> Result<serde_json::Value, ExecutionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.behavior {
                Behavior::Succeed(value) => Ok(value.clone()),
                Behavior::FailTransient => Err(ExecutionError::transient("503")),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(serde_json::json!(null))
                }
                Behavior::HangUntilCancelled => {
                    ctx.cancellation.cancelled().await;
                    self.cancels.fetch_add(1, Ordering::SeqCst);
                    Err(ExecutionError::transient("attempt cancelled"))
                }
                Behavior::Panic => panic!("scripted failure"),
            }
        }
    }

    struct Fixture {
        pool: WorkerPool,
        queue: Arc<FallbackQueue>,
        events: mpsc::Receiver<omniq_domain::WorkerEvent>,
        calls: Arc<AtomicU32>,
        cancels: Arc<AtomicU32>,
    }

    fn fixture(behavior: Behavior, max_attempts: u32, timeout_seconds: u64) -> Fixture {
        let calls = Arc::new(AtomicU32::new(0));
        let cancels = Arc::new(AtomicU32::new(0));
        let registry = omniq_domain::TaskRegistry::new();
        registry
            .register(
                TaskDefinition {
                    kind: "scripted".to_string(),
                    default_priority: TaskPriority::Medium,
                    timeout_seconds,
                    max_attempts,
                },
                Arc::new(ScriptedHandler {
                    calls: Arc::clone(&calls),
                    cancels: Arc::clone(&cancels),
                    behavior,
                }),
            )
            .unwrap();
        let registry = Arc::new(registry);

        let queue = Arc::new(FallbackQueue::new(
            Arc::clone(&registry),
            &QueueConfig {
                retry_backoff_base_ms: 10,
                retry_backoff_cap_ms: 20,
                ..QueueConfig::default()
            },
        ));
        let (sink, events) = EventSink::channel(64);
        let pool = WorkerPool::new(
            queue.clone() as Arc<dyn TaskQueue>,
            registry,
            sink,
            WorkerPoolConfig {
                global_ceiling: 4,
                dequeue_timeout_ms: 50,
                idle_backoff_ms: 10,
                event_buffer_size: 64,
            },
        );
        Fixture {
            pool,
            queue,
            events,
            calls,
            cancels,
        }
    }

    fn submission() -> TaskSubmission {
        TaskSubmission {
            kind: "scripted".to_string(),
            tenant_id: "alpha".to_string(),
            priority: TaskPriority::Medium,
            payload: serde_json::json!({}),
        }
    }

    async fn next_event(fx: &mut Fixture) -> omniq_domain::WorkerEvent {
        timeout(Duration::from_secs(5), fx.events.recv())
            .await
            .expect("event in time")
            .expect("event channel open")
    }

    #[tokio::test]
    async fn completed_task_emits_event_with_result() {
        let mut fx = fixture(
            Behavior::Succeed(serde_json::json!({"passed": true})),
            3,
            30,
        );
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        let id = fx.queue.enqueue(submission()).await.unwrap();

        let event = next_event(&mut fx).await;
        assert_eq!(event.outcome, TaskOutcome::Completed);
        assert_eq!(event.result, Some(serde_json::json!({"passed": true})));

        let stored = fx.queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn transient_failures_use_exactly_the_attempt_budget() {
        let mut fx = fixture(Behavior::FailTransient, 3, 30);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        let id = fx.queue.enqueue(submission()).await.unwrap();

        assert_eq!(next_event(&mut fx).await.outcome, TaskOutcome::Retried);
        assert_eq!(next_event(&mut fx).await.outcome, TaskOutcome::Retried);
        assert_eq!(
            next_event(&mut fx).await.outcome,
            TaskOutcome::DeadLettered
        );
        assert_eq!(fx.calls.load(Ordering::SeqCst), 3);

        let stored = fx.queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert_eq!(stored.attempt_count, 3);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn hung_handler_is_abandoned_at_the_deadline() {
        let mut fx = fixture(Behavior::Hang, 1, 1);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        let started = std::time::Instant::now();
        let id = fx.queue.enqueue(submission()).await.unwrap();

        let event = next_event(&mut fx).await;
        assert!(event.timed_out);
        assert_eq!(event.outcome, TaskOutcome::DeadLettered);
        // abandoned within a second of the 1s deadline
        assert!(started.elapsed() < Duration::from_secs(2));

        let stored = fx.queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn ceiling_refuses_further_growth() {
        let fx = fixture(Behavior::FailTransient, 1, 30);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 3)
            .unwrap();
        fx.pool
            .set_worker_count("beta", TaskPriority::Low, 1)
            .unwrap();
        let err = fx
            .pool
            .set_worker_count("gamma", TaskPriority::High, 1)
            .unwrap_err();
        assert!(matches!(err, OmniqError::ResourceExhausted(_)));
        assert_eq!(fx.pool.total_workers(), 4);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_handler_fails_the_attempt_not_the_unit() {
        let mut fx = fixture(Behavior::Panic, 2, 30);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        let id = fx.queue.enqueue(submission()).await.unwrap();

        // a panic counts as a transient attempt failure
        assert_eq!(next_event(&mut fx).await.outcome, TaskOutcome::Retried);
        assert_eq!(
            next_event(&mut fx).await.outcome,
            TaskOutcome::DeadLettered
        );
        let stored = fx.queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert_eq!(fx.queue.stats().await.unwrap().used_bytes, 0);

        // the unit survives and keeps draining
        assert_eq!(fx.pool.worker_count("alpha", TaskPriority::Medium), 1);
        fx.queue.enqueue(submission()).await.unwrap();
        assert_eq!(next_event(&mut fx).await.outcome, TaskOutcome::Retried);
        fx.pool.shutdown().await;
    }

    #[tokio::test]
    async fn deadline_cancels_the_attempt_token_before_abandonment() {
        let mut fx = fixture(Behavior::HangUntilCancelled, 1, 1);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        fx.queue.enqueue(submission()).await.unwrap();

        let event = next_event(&mut fx).await;
        assert!(event.timed_out);
        assert_eq!(event.outcome, TaskOutcome::DeadLettered);
        // the handler observed the token and wound down on its own
        assert_eq!(fx.cancels.load(Ordering::SeqCst), 1);
        fx.pool.shutdown().await;
    }

    /// Queue double that spends time on bookkeeping between claiming a task
    /// and handing it over, like the broker backend does.
    struct SlowClaimQueue {
        inner: Arc<FallbackQueue>,
        post_claim_delay: Duration,
    }

    #[async_trait]
    impl TaskQueue for SlowClaimQueue {
        async fn enqueue(&self, submission: TaskSubmission) -> OmniqResult<String> {
            self.inner.enqueue(submission).await
        }

        async fn dequeue(
            &self,
            tenant: Option<&str>,
            lanes: &[TaskPriority],
            timeout: Duration,
        ) -> OmniqResult<Option<Task>> {
            let claimed = self.inner.dequeue(tenant, lanes, timeout).await?;
            if claimed.is_some() {
                tokio::time::sleep(self.post_claim_delay).await;
            }
            Ok(claimed)
        }

        async fn ack(&self, task: &Task, result: serde_json::Value) -> OmniqResult<()> {
            self.inner.ack(task, result).await
        }

        async fn nack(
            &self,
            task: &Task,
            error: ExecutionError,
        ) -> OmniqResult<omniq_domain::NackOutcome> {
            self.inner.nack(task, error).await
        }

        async fn get_task(&self, id: &str) -> OmniqResult<Option<Task>> {
            self.inner.get_task(id).await
        }

        async fn depth(&self, priority: TaskPriority) -> OmniqResult<usize> {
            self.inner.depth(priority).await
        }

        async fn tenant_depth(&self, tenant: &str) -> OmniqResult<usize> {
            self.inner.tenant_depth(tenant).await
        }

        async fn stats(&self) -> OmniqResult<omniq_domain::QueueStats> {
            self.inner.stats().await
        }

        fn backend_name(&self) -> &'static str {
            self.inner.backend_name()
        }
    }

    #[tokio::test]
    async fn retire_mid_claim_never_loses_the_task() {
        let calls = Arc::new(AtomicU32::new(0));
        let registry = omniq_domain::TaskRegistry::new();
        registry
            .register(
                TaskDefinition {
                    kind: "scripted".to_string(),
                    default_priority: TaskPriority::Medium,
                    timeout_seconds: 30,
                    max_attempts: 1,
                },
                Arc::new(ScriptedHandler {
                    calls: Arc::clone(&calls),
                    cancels: Arc::new(AtomicU32::new(0)),
                    behavior: Behavior::Succeed(serde_json::json!(null)),
                }),
            )
            .unwrap();
        let registry = Arc::new(registry);
        let inner = Arc::new(FallbackQueue::new(
            Arc::clone(&registry),
            &QueueConfig::default(),
        ));
        let queue = Arc::new(SlowClaimQueue {
            inner: Arc::clone(&inner),
            post_claim_delay: Duration::from_millis(150),
        });
        let (sink, mut events) = EventSink::channel(16);
        let pool = WorkerPool::new(
            queue as Arc<dyn TaskQueue>,
            registry,
            sink,
            WorkerPoolConfig {
                global_ceiling: 4,
                dequeue_timeout_ms: 500,
                idle_backoff_ms: 10,
                event_buffer_size: 16,
            },
        );

        let id = inner.enqueue(submission()).await.unwrap();
        pool.set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        // retire while the unit is still mid-claim
        tokio::time::sleep(Duration::from_millis(50)).await;
        pool.set_worker_count("alpha", TaskPriority::Medium, 0)
            .unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("event channel open");
        assert_eq!(event.outcome, TaskOutcome::Completed);
        let stored = inner.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn shrink_retires_units() {
        let fx = fixture(Behavior::FailTransient, 1, 30);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 3)
            .unwrap();
        assert_eq!(fx.pool.worker_count("alpha", TaskPriority::Medium), 3);
        fx.pool
            .set_worker_count("alpha", TaskPriority::Medium, 1)
            .unwrap();
        assert_eq!(fx.pool.worker_count("alpha", TaskPriority::Medium), 1);
        assert_eq!(fx.pool.total_workers(), 1);
        fx.pool.shutdown().await;
    }
}
