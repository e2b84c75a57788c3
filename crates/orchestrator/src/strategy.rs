use omniq_core::errors::{OmniqError, OmniqResult};

/// Per-tenant inputs for one scaling decision.
#[derive(Debug, Clone, Copy)]
pub struct StrategyInput {
    /// Workers needed to clear the tenant's backlog within the latency
    /// target at the expected service rate.
    pub demand_workers: u32,
    pub current_workers: u32,
    pub min_workers: u32,
    pub max_workers: u32,
    pub queue_depth: usize,
    pub throughput_per_hour: f64,
    pub tasks_per_worker_hour: u32,
}

/// Turns measured demand into a desired worker count. Strategies only pick
/// the target; clamping, damping and the global ceiling are applied by the
/// orchestrator afterwards.
pub trait ScalingStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn desired_workers(&self, input: &StrategyInput) -> u32;
}

/// Runs the fewest workers that still clear the backlog; an idle tenant
/// drops to its floor.
pub struct CostStrategy;

impl ScalingStrategy for CostStrategy {
    fn name(&self) -> &'static str {
        "cost"
    }

    fn desired_workers(&self, input: &StrategyInput) -> u32 {
        if input.queue_depth == 0 {
            input.min_workers
        } else {
            input.demand_workers
        }
    }
}

/// Tracks demand but keeps 20% headroom over the observed throughput so a
/// steady stream does not oscillate.
pub struct BalancedStrategy;

impl ScalingStrategy for BalancedStrategy {
    fn name(&self) -> &'static str {
        "balanced"
    }

    fn desired_workers(&self, input: &StrategyInput) -> u32 {
        let sustain = if input.tasks_per_worker_hour == 0 {
            0
        } else {
            (input.throughput_per_hour * 1.2 / input.tasks_per_worker_hour as f64).ceil() as u32
        };
        input.demand_workers.max(sustain)
    }
}

/// Always runs at the tenant's ceiling; latency over cost.
pub struct PerformanceStrategy;

impl ScalingStrategy for PerformanceStrategy {
    fn name(&self) -> &'static str {
        "performance"
    }

    fn desired_workers(&self, input: &StrategyInput) -> u32 {
        input.max_workers
    }
}

pub fn strategy_for(name: &str) -> OmniqResult<Box<dyn ScalingStrategy>> {
    match name {
        "cost" => Ok(Box::new(CostStrategy)),
        "balanced" => Ok(Box::new(BalancedStrategy)),
        "performance" => Ok(Box::new(PerformanceStrategy)),
        other => Err(OmniqError::config(format!(
            "unknown scaling strategy: {other}"
        ))),
    }
}
