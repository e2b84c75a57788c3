use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use omniq_core::config::{ChannelConfig, OrchestratorConfig};
use omniq_core::errors::{OmniqError, OmniqResult};
use omniq_domain::{
    AllocationState, MetricsSnapshot, ScalingChange, TaskPriority, TenantAllocation,
};
use omniq_worker::WorkerPool;

use crate::strategy::{strategy_for, ScalingStrategy, StrategyInput};

/// Periodically reconciles per-tenant worker allocations against the latest
/// metrics snapshot. Decisions are damped to one bounded step per cycle and
/// gated so the pool is not resized on noise.
pub struct ScalingOrchestrator {
    pool: Arc<WorkerPool>,
    metrics: watch::Receiver<Arc<MetricsSnapshot>>,
    strategy: Box<dyn ScalingStrategy>,
    config: OrchestratorConfig,
    allocations: Mutex<BTreeMap<String, TenantAllocation>>,
    changes: Mutex<VecDeque<ScalingChange>>,
}

impl ScalingOrchestrator {
    pub fn new(
        pool: Arc<WorkerPool>,
        metrics: watch::Receiver<Arc<MetricsSnapshot>>,
        channels: &[ChannelConfig],
        config: OrchestratorConfig,
    ) -> OmniqResult<Self> {
        let strategy = strategy_for(&config.strategy)?;
        let mut allocations = BTreeMap::new();
        for channel in channels {
            let priority_class = TaskPriority::parse(&channel.priority_class)?;
            allocations.insert(
                channel.tenant_id.clone(),
                TenantAllocation::new(
                    channel.tenant_id.clone(),
                    priority_class,
                    channel.min_workers,
                    channel.max_workers,
                ),
            );
        }
        Ok(Self {
            pool,
            metrics,
            strategy,
            config,
            allocations: Mutex::new(allocations),
            changes: Mutex::new(VecDeque::new()),
        })
    }

    fn lock_allocations(&self) -> OmniqResult<MutexGuard<'_, BTreeMap<String, TenantAllocation>>> {
        self.allocations
            .lock()
            .map_err(|_| OmniqError::Internal("allocation lock poisoned".to_string()))
    }

    /// Brings every tenant up to its floor. Called once at startup.
    pub fn apply_minimums(&self) -> OmniqResult<()> {
        let mut allocations = self.lock_allocations()?;
        for alloc in allocations.values_mut() {
            self.pool
                .set_worker_count(&alloc.tenant_id, alloc.priority_class, alloc.min_workers)?;
            alloc.current_workers = alloc.min_workers;
            alloc.updated_at = Utc::now();
        }
        Ok(())
    }

    pub fn allocations(&self) -> Vec<TenantAllocation> {
        self.lock_allocations()
            .map(|a| a.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn changes(&self) -> Vec<ScalingChange> {
        match self.changes.lock() {
            Ok(changes) => changes.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// One reconcile pass. Returns how many allocations changed. A missing
    /// or stale snapshot makes the whole pass a no-op.
    pub fn evaluate_once(&self) -> OmniqResult<usize> {
        let snapshot = self.metrics.borrow().clone();
        let now = Utc::now();
        let max_age =
            chrono::Duration::seconds(2 * self.config.evaluation_interval_seconds as i64);
        match snapshot.age(now) {
            None => {
                debug!("no metrics snapshot yet, skipping scaling pass");
                return Ok(0);
            }
            Some(age) if age > max_age => {
                warn!(
                    age_seconds = age.num_seconds(),
                    "metrics snapshot is stale, skipping scaling pass"
                );
                return Ok(0);
            }
            _ => {}
        }

        let mut allocations = self.lock_allocations()?;
        let mut applied = 0;
        for alloc in allocations.values_mut() {
            let depth = snapshot.tenant_depth(&alloc.tenant_id);
            let demand = self.demand_workers(depth);
            let desired = alloc.clamp(self.strategy.desired_workers(&StrategyInput {
                demand_workers: demand,
                current_workers: alloc.current_workers,
                min_workers: alloc.min_workers,
                max_workers: alloc.max_workers,
                queue_depth: depth,
                throughput_per_hour: snapshot.throughput_per_hour,
                tasks_per_worker_hour: self.config.tasks_per_worker_hour,
            }));

            let current = alloc.current_workers;
            let step = self.config.max_step_per_cycle;
            let mut next = if desired > current {
                current + step.min(desired - current)
            } else {
                current - step.min(current - desired)
            };

            // gates: growth needs real backlog, shrink needs a drained and
            // quiet tenant
            let reason = if next > current {
                if depth < self.config.queue_high_water {
                    next = current;
                    String::new()
                } else {
                    let headroom = self
                        .pool
                        .global_ceiling()
                        .saturating_sub(self.pool.total_workers());
                    next = next.min(current + headroom);
                    format!(
                        "backlog of {depth} over high water {}",
                        self.config.queue_high_water
                    )
                }
            } else if next < current {
                let quiet = snapshot.throughput_per_hour < self.config.throughput_low_water
                    && depth <= self.config.scale_down_depth_threshold;
                if quiet {
                    format!(
                        "drained: depth {depth}, throughput {:.1}/h",
                        snapshot.throughput_per_hour
                    )
                } else {
                    next = current;
                    String::new()
                }
            } else {
                String::new()
            };

            if next == current {
                alloc.state = AllocationState::Stable;
                continue;
            }

            self.pool
                .set_worker_count(&alloc.tenant_id, alloc.priority_class, next)?;
            alloc.state = if next > current {
                AllocationState::ScalingUp
            } else {
                AllocationState::ScalingDown
            };
            alloc.current_workers = next;
            alloc.updated_at = Utc::now();
            applied += 1;
            metrics::counter!("omniq_scaling_changes_total").increment(1);
            info!(
                tenant = %alloc.tenant_id,
                from = current,
                to = next,
                strategy = self.strategy.name(),
                %reason,
                "allocation changed"
            );
            self.record_change(ScalingChange {
                tenant_id: alloc.tenant_id.clone(),
                strategy: self.strategy.name().to_string(),
                from_workers: current,
                to_workers: next,
                reason,
                applied_at: alloc.updated_at,
            });
        }
        Ok(applied)
    }

    /// Workers needed to clear `depth` tasks within the latency target at
    /// the expected per-worker service rate.
    fn demand_workers(&self, depth: usize) -> u32 {
        let denom =
            self.config.tasks_per_worker_hour as u64 * self.config.target_latency_seconds;
        if denom == 0 || depth == 0 {
            return 0;
        }
        let numer = depth as u64 * 3_600;
        (numer.div_ceil(denom)).min(u32::MAX as u64) as u32
    }

    fn record_change(&self, change: ScalingChange) {
        if let Ok(mut changes) = self.changes.lock() {
            changes.push_back(change);
            while changes.len() > self.config.history_limit {
                changes.pop_front();
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.evaluation_interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.evaluate_once() {
                        warn!(error = %e, "scaling pass failed");
                    }
                }
            }
        }
        debug!("scaling orchestrator stopped");
    }
}
