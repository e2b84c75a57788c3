use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use omniq_core::errors::OmniqResult;

use crate::task::{ExecutionError, Task, TaskPriority, TaskSubmission};

/// What became of a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Re-admitted for another attempt, not before `ready_at`.
    Retried { ready_at: chrono::DateTime<chrono::Utc> },
    /// Attempt budget exhausted or failure was permanent.
    DeadLettered,
}

/// Point-in-time counters for one backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub backend: String,
    pub pending_by_priority: BTreeMap<TaskPriority, usize>,
    /// Pending depth per tenant across all priorities.
    pub pending_by_tenant: BTreeMap<String, usize>,
    pub running: usize,
    pub completed: u64,
    pub dead_lettered: u64,
    /// Client-side estimate of bytes held by pending and running payloads.
    pub used_bytes: usize,
}

impl QueueStats {
    pub fn pending_total(&self) -> usize {
        self.pending_by_priority.values().sum()
    }
}

/// Priority task queue shared by producers, the worker pool and the
/// orchestrator. Implemented by the broker-backed queue and the in-process
/// fallback; callers never know which one they hold.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Validates against the registry, assigns identity and admits the task.
    /// Returns the task id.
    async fn enqueue(&self, submission: TaskSubmission) -> OmniqResult<String>;

    /// Hands out the most urgent ready task, scanning `lanes` in order.
    /// `tenant` restricts the scan to one tenant; `None` rotates fairly
    /// across tenants. Waits up to `timeout` before returning `None`. The
    /// returned task is already marked running.
    async fn dequeue(
        &self,
        tenant: Option<&str>,
        lanes: &[TaskPriority],
        timeout: Duration,
    ) -> OmniqResult<Option<Task>>;

    /// Records a successful attempt. The task becomes terminal and stays
    /// queryable for the retention window.
    async fn ack(&self, task: &Task, result: serde_json::Value) -> OmniqResult<()>;

    /// Records a failed attempt; either re-admits the task with backoff or
    /// dead-letters it.
    async fn nack(&self, task: &Task, error: ExecutionError) -> OmniqResult<NackOutcome>;

    /// Looks up a task by id, including terminal ones still in retention.
    async fn get_task(&self, id: &str) -> OmniqResult<Option<Task>>;

    /// Pending depth for one priority class, all tenants combined.
    async fn depth(&self, priority: TaskPriority) -> OmniqResult<usize>;

    /// Pending depth for one tenant across all priority classes.
    async fn tenant_depth(&self, tenant: &str) -> OmniqResult<usize>;

    async fn stats(&self) -> OmniqResult<QueueStats>;

    fn backend_name(&self) -> &'static str;
}
