use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use omniq_core::errors::{OmniqError, OmniqResult};

/// Scheduling class of a task. Ordering is by urgency: `Urgent` compares
/// greater than `Low`.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl TaskPriority {
    /// All classes, most urgent first. Dequeue scans follow this order.
    pub const DESCENDING: [TaskPriority; 4] = [
        TaskPriority::Urgent,
        TaskPriority::High,
        TaskPriority::Medium,
        TaskPriority::Low,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskPriority::Urgent => "urgent",
            TaskPriority::High => "high",
            TaskPriority::Medium => "medium",
            TaskPriority::Low => "low",
        }
    }

    pub fn parse(s: &str) -> OmniqResult<Self> {
        match s {
            "urgent" => Ok(TaskPriority::Urgent),
            "high" => Ok(TaskPriority::High),
            "medium" => Ok(TaskPriority::Medium),
            "low" => Ok(TaskPriority::Low),
            other => Err(OmniqError::validation(format!(
                "unknown priority: {other} (expected urgent, high, medium or low)"
            ))),
        }
    }

    /// Priority classes an execution unit bound to this class may drain,
    /// own class first. Urgent units help out on high, high on medium,
    /// medium on low; low units stay on their own lane.
    pub fn dequeue_lanes(&self) -> &'static [TaskPriority] {
        match self {
            TaskPriority::Urgent => &[TaskPriority::Urgent, TaskPriority::High],
            TaskPriority::High => &[TaskPriority::High, TaskPriority::Medium],
            TaskPriority::Medium => &[TaskPriority::Medium, TaskPriority::Low],
            TaskPriority::Low => &[TaskPriority::Low],
        }
    }
}

impl std::fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state. Transitions are forward-only except for the retry edge
/// `Failed -> Pending`, which re-admits a transiently failed task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    DeadLetter,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::DeadLetter)
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (TaskStatus::Pending, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
                | (TaskStatus::Failed, TaskStatus::Pending)
                | (TaskStatus::Failed, TaskStatus::DeadLetter)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a task handler. Transient failures are retried up to
/// the task's attempt budget; permanent ones dead-letter immediately.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum ExecutionError {
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl ExecutionError {
    pub fn transient<S: Into<String>>(msg: S) -> Self {
        Self::Transient(msg.into())
    }
    pub fn permanent<S: Into<String>>(msg: S) -> Self {
        Self::Permanent(msg.into())
    }
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutionError::Transient(_))
    }
}

/// Caller-facing submission. The queue fills in identity and bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSubmission {
    pub kind: String,
    pub tenant_id: String,
    pub priority: TaskPriority,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: String,
    pub tenant_id: String,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    /// Completed attempts so far. A freshly enqueued task has made none.
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub timeout_seconds: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Earliest moment the task may be handed to a worker. Retries push
    /// this into the future by the backoff delay.
    pub ready_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<ExecutionError>,
    pub result: Option<serde_json::Value>,
}

impl Task {
    pub fn new(submission: TaskSubmission, timeout_seconds: u64, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: submission.kind,
            tenant_id: submission.tenant_id,
            priority: submission.priority,
            status: TaskStatus::Pending,
            payload: submission.payload,
            attempt_count: 0,
            max_attempts,
            timeout_seconds,
            created_at: now,
            updated_at: now,
            ready_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            result: None,
        }
    }

    fn transition(&mut self, next: TaskStatus) -> OmniqResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(OmniqError::validation(format!(
                "task {}: illegal status transition {} -> {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Marks the start of an attempt. Increments the attempt counter.
    pub fn mark_running(&mut self) -> OmniqResult<()> {
        self.transition(TaskStatus::Running)?;
        self.attempt_count += 1;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_completed(&mut self, result: serde_json::Value) -> OmniqResult<()> {
        self.transition(TaskStatus::Completed)?;
        self.result = Some(result);
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    pub fn mark_failed(&mut self, error: ExecutionError) -> OmniqResult<()> {
        self.transition(TaskStatus::Failed)?;
        self.last_error = Some(error);
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// Re-admits a failed task for another attempt after `delay`.
    pub fn prepare_retry(&mut self, delay: Duration) -> OmniqResult<()> {
        self.transition(TaskStatus::Pending)?;
        self.ready_at = self.updated_at + delay;
        self.started_at = None;
        self.finished_at = None;
        Ok(())
    }

    pub fn mark_dead_letter(&mut self) -> OmniqResult<()> {
        self.transition(TaskStatus::DeadLetter)?;
        self.finished_at = Some(self.updated_at);
        Ok(())
    }

    /// Whether another attempt is allowed after a transient failure.
    pub fn has_attempts_left(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.ready_at <= now
    }
}
