use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use omniq_core::config::QueueConfig;
use omniq_core::errors::{OmniqError, OmniqResult};
use omniq_domain::{
    ExecutionError, NackOutcome, QueueStats, Task, TaskPriority, TaskQueue, TaskRegistry,
    TaskSubmission,
};

use crate::backoff::BackoffPolicy;
use crate::quota::{payload_bytes, QuotaTracker};

const LANES: usize = 4;

fn lane_index(priority: TaskPriority) -> usize {
    match priority {
        TaskPriority::Urgent => 0,
        TaskPriority::High => 1,
        TaskPriority::Medium => 2,
        TaskPriority::Low => 3,
    }
}

struct DelayedEntry {
    ready_at: DateTime<Utc>,
    task: Task,
}

// Min-heap on ready_at.
impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.task.id == other.task.id
    }
}
impl Eq for DelayedEntry {}
impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.task.id.cmp(&self.task.id))
    }
}

#[derive(Default)]
struct FallbackState {
    /// Tenants in first-seen order; round-robin cursors walk this.
    tenant_order: Vec<String>,
    /// Per-tenant FIFO lane per priority class.
    lanes: HashMap<String, [VecDeque<Task>; LANES]>,
    cursors: [usize; LANES],
    /// Retried tasks waiting out their backoff.
    delayed: BinaryHeap<DelayedEntry>,
    running: HashMap<String, Task>,
    /// Terminal tasks with their retention deadline.
    terminal: HashMap<String, (Task, DateTime<Utc>)>,
    pending_count: usize,
    completed: u64,
    dead_lettered: u64,
}

impl FallbackState {
    fn push_pending(&mut self, task: Task) {
        let tenant = task.tenant_id.clone();
        if !self.lanes.contains_key(&tenant) {
            self.tenant_order.push(tenant.clone());
            self.lanes.insert(tenant.clone(), Default::default());
        }
        let idx = lane_index(task.priority);
        if let Some(lanes) = self.lanes.get_mut(&tenant) {
            lanes[idx].push_back(task);
            self.pending_count += 1;
        }
    }

    /// Moves due retries back onto their lanes; returns the next wakeup for
    /// retries still waiting.
    fn promote_due(&mut self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        while let Some(entry) = self.delayed.peek() {
            if entry.ready_at > now {
                return Some(entry.ready_at);
            }
            if let Some(entry) = self.delayed.pop() {
                self.push_pending(entry.task);
            }
        }
        None
    }

    fn take_ready(&mut self, tenant: Option<&str>, scan: &[TaskPriority]) -> Option<Task> {
        for priority in scan {
            let idx = lane_index(*priority);
            match tenant {
                Some(t) => {
                    if let Some(lanes) = self.lanes.get_mut(t) {
                        if let Some(task) = lanes[idx].pop_front() {
                            self.pending_count -= 1;
                            return Some(task);
                        }
                    }
                }
                None => {
                    let n = self.tenant_order.len();
                    for offset in 0..n {
                        let ti = (self.cursors[idx] + offset) % n;
                        let tenant_id = self.tenant_order[ti].clone();
                        if let Some(lanes) = self.lanes.get_mut(&tenant_id) {
                            if let Some(task) = lanes[idx].pop_front() {
                                self.cursors[idx] = (ti + 1) % n;
                                self.pending_count -= 1;
                                return Some(task);
                            }
                        }
                    }
                }
            }
        }
        None
    }

    fn sweep_terminal(&mut self, now: DateTime<Utc>) {
        self.terminal.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

/// Memory-backed queue used when no broker is reachable. Same admission,
/// fairness and retry semantics as the broker backend, bounded by a pending
/// cap instead of broker storage.
pub struct FallbackQueue {
    registry: Arc<TaskRegistry>,
    quota: QuotaTracker,
    backoff: BackoffPolicy,
    retention: chrono::Duration,
    max_pending: usize,
    state: Mutex<FallbackState>,
    notify: Notify,
}

impl FallbackQueue {
    pub fn new(registry: Arc<TaskRegistry>, config: &QueueConfig) -> Self {
        Self {
            registry,
            quota: QuotaTracker::new(config.max_payload_bytes, config.max_total_bytes),
            backoff: BackoffPolicy::new(config.retry_backoff_base_ms, config.retry_backoff_cap_ms),
            retention: chrono::Duration::seconds(config.retention_seconds as i64),
            max_pending: config.fallback_max_pending,
            state: Mutex::new(FallbackState::default()),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> OmniqResult<MutexGuard<'_, FallbackState>> {
        self.state
            .lock()
            .map_err(|_| OmniqError::Internal("fallback queue lock poisoned".to_string()))
    }

    fn finish(&self, state: &mut FallbackState, task: Task) -> OmniqResult<()> {
        self.quota.release(payload_bytes(&task.payload));
        state
            .terminal
            .insert(task.id.clone(), (task, Utc::now() + self.retention));
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for FallbackQueue {
    async fn enqueue(&self, submission: TaskSubmission) -> OmniqResult<String> {
        if submission.tenant_id.is_empty() {
            return Err(OmniqError::validation("tenant_id cannot be empty"));
        }
        let definition = self.registry.definition(&submission.kind)?;
        let bytes = payload_bytes(&submission.payload);
        self.quota.reserve(bytes)?;

        let mut state = match self.lock() {
            Ok(state) => state,
            Err(e) => {
                self.quota.release(bytes);
                return Err(e);
            }
        };
        if state.pending_count + state.delayed.len() >= self.max_pending {
            drop(state);
            self.quota.release(bytes);
            return Err(OmniqError::quota(format!(
                "fallback queue is full ({} tasks pending)",
                self.max_pending
            )));
        }

        let task = Task::new(
            submission,
            definition.timeout_seconds,
            definition.max_attempts,
        );
        let id = task.id.clone();
        debug!(task_id = %id, kind = %task.kind, tenant = %task.tenant_id,
               priority = %task.priority, "task admitted to fallback queue");
        state.push_pending(task);
        drop(state);
        self.notify.notify_one();
        Ok(id)
    }

    async fn dequeue(
        &self,
        tenant: Option<&str>,
        lanes: &[TaskPriority],
        timeout: Duration,
    ) -> OmniqResult<Option<Task>> {
        let deadline = Instant::now() + timeout;
        loop {
            let next_due = {
                let mut state = self.lock()?;
                let now = Utc::now();
                let next_due = state.promote_due(now);
                if let Some(mut task) = state.take_ready(tenant, lanes) {
                    task.mark_running()?;
                    state.running.insert(task.id.clone(), task.clone());
                    return Ok(Some(task));
                }
                next_due
            };

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let mut wait = deadline - now;
            if let Some(due) = next_due {
                let until_due = (due - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                wait = wait.min(until_due.max(Duration::from_millis(1)));
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }

    async fn ack(&self, task: &Task, result: serde_json::Value) -> OmniqResult<()> {
        let mut state = self.lock()?;
        let mut finished = state
            .running
            .remove(&task.id)
            .ok_or_else(|| OmniqError::task_not_found(task.id.clone()))?;
        finished.mark_completed(result)?;
        state.completed += 1;
        self.finish(&mut state, finished)
    }

    async fn nack(&self, task: &Task, error: ExecutionError) -> OmniqResult<NackOutcome> {
        let mut state = self.lock()?;
        let mut failed = state
            .running
            .remove(&task.id)
            .ok_or_else(|| OmniqError::task_not_found(task.id.clone()))?;
        failed.mark_failed(error.clone())?;

        if error.is_transient() && failed.has_attempts_left() {
            let delay = self.backoff.delay(failed.attempt_count);
            failed.prepare_retry(delay)?;
            let ready_at = failed.ready_at;
            debug!(task_id = %failed.id, attempt = failed.attempt_count,
                   delay_ms = delay.num_milliseconds(), "task scheduled for retry");
            state.delayed.push(DelayedEntry {
                ready_at,
                task: failed,
            });
            drop(state);
            self.notify.notify_one();
            return Ok(NackOutcome::Retried { ready_at });
        }

        failed.mark_dead_letter()?;
        warn!(task_id = %failed.id, kind = %failed.kind, attempts = failed.attempt_count,
              error = %error, "task dead-lettered");
        state.dead_lettered += 1;
        self.finish(&mut state, failed)?;
        Ok(NackOutcome::DeadLettered)
    }

    async fn get_task(&self, id: &str) -> OmniqResult<Option<Task>> {
        let mut state = self.lock()?;
        state.sweep_terminal(Utc::now());
        if let Some(task) = state.running.get(id) {
            return Ok(Some(task.clone()));
        }
        if let Some((task, _)) = state.terminal.get(id) {
            return Ok(Some(task.clone()));
        }
        for entry in state.delayed.iter() {
            if entry.task.id == id {
                return Ok(Some(entry.task.clone()));
            }
        }
        for lanes in state.lanes.values() {
            for lane in lanes {
                if let Some(task) = lane.iter().find(|t| t.id == id) {
                    return Ok(Some(task.clone()));
                }
            }
        }
        Ok(None)
    }

    async fn depth(&self, priority: TaskPriority) -> OmniqResult<usize> {
        let state = self.lock()?;
        let idx = lane_index(priority);
        Ok(state.lanes.values().map(|lanes| lanes[idx].len()).sum())
    }

    async fn tenant_depth(&self, tenant: &str) -> OmniqResult<usize> {
        let state = self.lock()?;
        Ok(state
            .lanes
            .get(tenant)
            .map(|lanes| lanes.iter().map(VecDeque::len).sum())
            .unwrap_or(0))
    }

    async fn stats(&self) -> OmniqResult<QueueStats> {
        let mut state = self.lock()?;
        state.sweep_terminal(Utc::now());
        let mut stats = QueueStats {
            backend: self.backend_name().to_string(),
            running: state.running.len(),
            completed: state.completed,
            dead_lettered: state.dead_lettered,
            used_bytes: self.quota.used_bytes(),
            ..Default::default()
        };
        for priority in TaskPriority::DESCENDING {
            let idx = lane_index(priority);
            let depth: usize = state.lanes.values().map(|lanes| lanes[idx].len()).sum();
            stats.pending_by_priority.insert(priority, depth);
        }
        for (tenant, lanes) in &state.lanes {
            let depth: usize = lanes.iter().map(VecDeque::len).sum();
            if depth > 0 {
                stats.pending_by_tenant.insert(tenant.clone(), depth);
            }
        }
        Ok(stats)
    }

    fn backend_name(&self) -> &'static str {
        "fallback"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use omniq_domain::{TaskContext, TaskDefinition, TaskHandler, TaskStatus};

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

    fn registry() -> Arc<TaskRegistry> {
        let registry = TaskRegistry::new();
        for (kind, attempts) in [("content_generation", 3), ("publish_video", 2)] {
            registry
                .register(
                    TaskDefinition {
                        kind: kind.to_string(),
                        default_priority: TaskPriority::Medium,
                        timeout_seconds: 30,
                        max_attempts: attempts,
                    },
                    Arc::new(NoopHandler),
                )
                .unwrap();
        }
        Arc::new(registry)
    }

    fn queue_with(config: QueueConfig) -> FallbackQueue {
        FallbackQueue::new(registry(), &config)
    }

    fn queue() -> FallbackQueue {
        queue_with(QueueConfig {
            retry_backoff_base_ms: 10,
            retry_backoff_cap_ms: 40,
            ..QueueConfig::default()
        })
    }

    fn submission(tenant: &str, priority: TaskPriority) -> TaskSubmission {
        TaskSubmission {
            kind: "content_generation".to_string(),
            tenant_id: tenant.to_string(),
            priority,
            payload: serde_json::json!({"topic": "news"}),
        }
    }

    async fn drain_one(queue: &FallbackQueue) -> Task {
        queue
            .dequeue(None, &TaskPriority::DESCENDING, Duration::from_millis(200))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unregistered_kind_is_rejected() {
        let queue = queue();
        let mut bad = submission("t1", TaskPriority::Low);
        bad.kind = "unknown".to_string();
        let err = queue.enqueue(bad).await.unwrap_err();
        assert!(matches!(err, OmniqError::Validation(_)));
    }

    #[tokio::test]
    async fn higher_priority_always_wins() {
        let queue = queue();
        queue.enqueue(submission("t1", TaskPriority::Low)).await.unwrap();
        queue.enqueue(submission("t1", TaskPriority::Medium)).await.unwrap();
        queue.enqueue(submission("t1", TaskPriority::Urgent)).await.unwrap();

        assert_eq!(drain_one(&queue).await.priority, TaskPriority::Urgent);
        assert_eq!(drain_one(&queue).await.priority, TaskPriority::Medium);
        assert_eq!(drain_one(&queue).await.priority, TaskPriority::Low);
    }

    #[tokio::test]
    async fn three_urgent_drain_before_two_low() {
        let queue = queue();
        for _ in 0..2 {
            queue.enqueue(submission("t1", TaskPriority::Low)).await.unwrap();
        }
        for _ in 0..3 {
            queue.enqueue(submission("t1", TaskPriority::Urgent)).await.unwrap();
        }
        let order: Vec<TaskPriority> = [
            drain_one(&queue).await,
            drain_one(&queue).await,
            drain_one(&queue).await,
            drain_one(&queue).await,
            drain_one(&queue).await,
        ]
        .iter()
        .map(|t| t.priority)
        .collect();
        assert_eq!(
            order,
            vec![
                TaskPriority::Urgent,
                TaskPriority::Urgent,
                TaskPriority::Urgent,
                TaskPriority::Low,
                TaskPriority::Low
            ]
        );
    }

    #[tokio::test]
    async fn same_class_is_fifo() {
        let queue = queue();
        let first = queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        let second = queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        assert_eq!(drain_one(&queue).await.id, first);
        assert_eq!(drain_one(&queue).await.id, second);
    }

    #[tokio::test]
    async fn tenants_rotate_within_a_class() {
        let queue = queue();
        for _ in 0..2 {
            queue.enqueue(submission("alpha", TaskPriority::Medium)).await.unwrap();
            queue.enqueue(submission("beta", TaskPriority::Medium)).await.unwrap();
        }
        let tenants: Vec<String> = [
            drain_one(&queue).await,
            drain_one(&queue).await,
            drain_one(&queue).await,
            drain_one(&queue).await,
        ]
        .iter()
        .map(|t| t.tenant_id.clone())
        .collect();
        assert_eq!(tenants, vec!["alpha", "beta", "alpha", "beta"]);
    }

    #[tokio::test]
    async fn tenant_scoped_dequeue_ignores_other_tenants() {
        let queue = queue();
        queue.enqueue(submission("alpha", TaskPriority::High)).await.unwrap();
        let none = queue
            .dequeue(Some("beta"), &TaskPriority::DESCENDING, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(none.is_none());
        let task = queue
            .dequeue(Some("alpha"), &TaskPriority::DESCENDING, Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.tenant_id, "alpha");
    }

    #[tokio::test]
    async fn lane_restriction_is_honored() {
        let queue = queue();
        queue.enqueue(submission("t1", TaskPriority::Urgent)).await.unwrap();
        // a low-class unit only drains the low lane
        let none = queue
            .dequeue(None, TaskPriority::Low.dequeue_lanes(), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(none.is_none());
        let task = queue
            .dequeue(None, TaskPriority::Urgent.dequeue_lanes(), Duration::from_millis(20))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(task.priority, TaskPriority::Urgent);
    }

    #[tokio::test]
    async fn transient_failures_retry_exactly_max_attempts_times() {
        let queue = queue();
        let id = queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();

        for attempt in 1..=3u32 {
            let task = queue
                .dequeue(None, &TaskPriority::DESCENDING, Duration::from_millis(500))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(task.id, id);
            assert_eq!(task.attempt_count, attempt);
            let outcome = queue
                .nack(&task, ExecutionError::transient("503"))
                .await
                .unwrap();
            if attempt < 3 {
                assert!(matches!(outcome, NackOutcome::Retried { .. }));
            } else {
                assert_eq!(outcome, NackOutcome::DeadLettered);
            }
        }

        let stored = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert_eq!(stored.attempt_count, 3);
    }

    #[tokio::test]
    async fn permanent_failures_dead_letter_immediately() {
        let queue = queue();
        let id = queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        let task = drain_one(&queue).await;
        let outcome = queue
            .nack(&task, ExecutionError::permanent("bad payload"))
            .await
            .unwrap();
        assert_eq!(outcome, NackOutcome::DeadLettered);
        let stored = queue.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::DeadLetter);
        assert_eq!(stored.attempt_count, 1);
    }

    #[tokio::test]
    async fn retried_task_waits_out_its_backoff() {
        let queue = queue();
        queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        let task = drain_one(&queue).await;
        queue.nack(&task, ExecutionError::transient("flaky")).await.unwrap();

        // comes back once the delay elapses, via the same dequeue call
        let retried = queue
            .dequeue(None, &TaskPriority::DESCENDING, Duration::from_millis(500))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(retried.id, task.id);
        assert_eq!(retried.attempt_count, 2);
    }

    #[tokio::test]
    async fn pending_cap_rejects_with_quota_error() {
        let queue = queue_with(QueueConfig {
            fallback_max_pending: 2,
            ..QueueConfig::default()
        });
        queue.enqueue(submission("t1", TaskPriority::Low)).await.unwrap();
        queue.enqueue(submission("t1", TaskPriority::Low)).await.unwrap();
        let err = queue.enqueue(submission("t1", TaskPriority::Low)).await.unwrap_err();
        assert!(matches!(err, OmniqError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let queue = queue_with(QueueConfig {
            max_payload_bytes: 16,
            ..QueueConfig::default()
        });
        let mut sub = submission("t1", TaskPriority::Low);
        sub.payload = serde_json::json!({"blob": "x".repeat(64)});
        let err = queue.enqueue(sub).await.unwrap_err();
        assert!(matches!(err, OmniqError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn completed_tasks_stay_queryable_until_retention_expires() {
        let queue = queue_with(QueueConfig {
            retention_seconds: 0,
            ..QueueConfig::default()
        });
        let id = queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        let task = drain_one(&queue).await;
        queue.ack(&task, serde_json::json!({"ok": true})).await.unwrap();
        // zero retention: swept on the next lookup
        sleep(Duration::from_millis(5)).await;
        assert!(queue.get_task(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_releases_quota_bytes() {
        let queue = queue();
        queue.enqueue(submission("t1", TaskPriority::High)).await.unwrap();
        let before = queue.stats().await.unwrap().used_bytes;
        assert!(before > 0);
        let task = drain_one(&queue).await;
        queue.ack(&task, serde_json::json!(null)).await.unwrap();
        assert_eq!(queue.stats().await.unwrap().used_bytes, 0);
    }

    #[tokio::test]
    async fn empty_queue_times_out_with_none() {
        let queue = queue();
        let got = queue
            .dequeue(None, &TaskPriority::DESCENDING, Duration::from_millis(10))
            .await
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn stats_reflect_queue_contents() {
        let queue = queue();
        queue.enqueue(submission("alpha", TaskPriority::Urgent)).await.unwrap();
        queue.enqueue(submission("beta", TaskPriority::Low)).await.unwrap();
        let task = drain_one(&queue).await;
        queue.ack(&task, serde_json::json!(null)).await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.backend, "fallback");
        assert_eq!(stats.pending_total(), 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending_by_tenant.get("beta"), Some(&1));
    }
}
