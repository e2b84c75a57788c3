//! Metrics collection and autoscaling. The collector turns worker events
//! and queue depth samples into periodic snapshots; the orchestrator turns
//! snapshots into damped, gated per-tenant allocation changes.

pub mod collector;
pub mod scaler;
pub mod strategy;

pub use collector::{MetricsCollector, MetricsHandle};
pub use scaler::ScalingOrchestrator;
pub use strategy::{
    BalancedStrategy, CostStrategy, PerformanceStrategy, ScalingStrategy, StrategyInput,
};
