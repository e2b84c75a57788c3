//! Domain model of the task system: tasks and their lifecycle, the kind
//! registry, the queue abstraction and the metrics/allocation types shared
//! by the pool and the orchestrator.

pub mod metrics;
pub mod queue;
pub mod registry;
pub mod task;

pub use metrics::{
    AllocationState, MetricsSnapshot, ScalingChange, TaskOutcome, TenantAllocation, WorkerEvent,
};
pub use queue::{NackOutcome, QueueStats, TaskQueue};
pub use registry::{TaskContext, TaskDefinition, TaskHandler, TaskRegistry};
pub use task::{ExecutionError, Task, TaskPriority, TaskStatus, TaskSubmission};
