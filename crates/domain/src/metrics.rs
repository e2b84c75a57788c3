use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::TaskPriority;

/// How an attempt ended, from the pool's point of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed,
    /// Transient failure, re-admitted for another attempt.
    Retried,
    DeadLettered,
}

/// Emitted by execution units after every finished attempt. Feeds the
/// metrics collector over a bounded channel; under pressure events are
/// dropped and counted rather than blocking workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerEvent {
    pub task_id: String,
    pub tenant_id: String,
    pub kind: String,
    pub priority: TaskPriority,
    pub outcome: TaskOutcome,
    /// Time between enqueue and attempt start.
    pub wait_ms: u64,
    pub run_ms: u64,
    pub timed_out: bool,
    pub finished_at: DateTime<Utc>,
    /// Handler result, present on completion. Compliance-check results carry
    /// a `passed` flag the collector aggregates.
    pub result: Option<serde_json::Value>,
}

/// Aggregated view published by the metrics collector on every tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    pub queue_backend: String,
    pub depth_by_priority: BTreeMap<TaskPriority, usize>,
    pub depth_by_tenant: BTreeMap<String, usize>,
    /// Rolling one-hour counters.
    pub completed_last_hour: u64,
    pub retried_last_hour: u64,
    pub dead_lettered_last_hour: u64,
    pub timed_out_last_hour: u64,
    pub throughput_per_hour: f64,
    pub avg_wait_ms: f64,
    pub avg_run_ms: f64,
    /// Share of compliance-check completions whose result passed. `None`
    /// until at least one such result arrives.
    pub compliance_pass_rate: Option<f64>,
    pub events_dropped: u64,
    pub active_workers: u32,
}

impl MetricsSnapshot {
    pub fn pending_total(&self) -> usize {
        self.depth_by_priority.values().sum()
    }

    pub fn tenant_depth(&self, tenant: &str) -> usize {
        self.depth_by_tenant.get(tenant).copied().unwrap_or(0)
    }

    /// Snapshot age relative to `now`; `None` when nothing was captured yet.
    pub fn age(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.captured_at.map(|at| now - at)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AllocationState {
    Stable,
    ScalingUp,
    ScalingDown,
}

/// Worker allocation for one tenant. `min <= current <= max` always holds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantAllocation {
    pub tenant_id: String,
    pub priority_class: TaskPriority,
    pub min_workers: u32,
    pub max_workers: u32,
    pub current_workers: u32,
    pub state: AllocationState,
    pub updated_at: DateTime<Utc>,
}

impl TenantAllocation {
    pub fn new(
        tenant_id: String,
        priority_class: TaskPriority,
        min_workers: u32,
        max_workers: u32,
    ) -> Self {
        Self {
            tenant_id,
            priority_class,
            current_workers: min_workers,
            min_workers,
            max_workers,
            state: AllocationState::Stable,
            updated_at: Utc::now(),
        }
    }

    pub fn clamp(&self, desired: u32) -> u32 {
        desired.clamp(self.min_workers, self.max_workers)
    }
}

/// One applied scaling decision, kept for the API's change history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingChange {
    pub tenant_id: String,
    pub strategy: String,
    pub from_workers: u32,
    pub to_workers: u32,
    pub reason: String,
    pub applied_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_clamps_into_bounds() {
        let alloc = TenantAllocation::new("t".to_string(), TaskPriority::Medium, 2, 6);
        assert_eq!(alloc.current_workers, 2);
        assert_eq!(alloc.clamp(0), 2);
        assert_eq!(alloc.clamp(4), 4);
        assert_eq!(alloc.clamp(99), 6);
    }

    #[test]
    fn snapshot_age_tracks_capture_time() {
        let mut snap = MetricsSnapshot::default();
        assert!(snap.age(Utc::now()).is_none());
        snap.captured_at = Some(Utc::now() - chrono::Duration::seconds(90));
        let age = snap.age(Utc::now()).unwrap();
        assert!(age >= chrono::Duration::seconds(90));
    }
}
