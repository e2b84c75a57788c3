use serde::{Deserialize, Serialize};

/// Top-level service configuration, loaded once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub queue: QueueConfig,
    pub worker: WorkerPoolConfig,
    pub orchestrator: OrchestratorConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
    /// Directory holding one YAML file per channel (tenant).
    pub channels_dir: String,
    /// Task kinds the binary registers at startup. Each kind maps to a
    /// remote HTTP collaborator (content generation, publishing, compliance
    /// checking and the like are external services).
    #[serde(default)]
    pub task_kinds: Vec<TaskKindConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Broker connection URL (`redis://...`). Empty or missing selects the
    /// in-process fallback backend at startup.
    #[serde(default)]
    pub broker_url: Option<String>,
    /// Key namespace for broker-side structures.
    pub namespace: String,
    pub connect_timeout_seconds: u64,
    /// Broker dequeue polling interval.
    pub poll_interval_ms: u64,
    /// Retry backoff: `base * 2^attempts`, capped.
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    /// How long terminal tasks stay queryable before being discarded.
    pub retention_seconds: u64,
    /// Client-side quota limits. The managed broker tier is small, so both
    /// are checked before a message is ever sent.
    pub max_payload_bytes: usize,
    pub max_total_bytes: usize,
    /// Pending-task bound for the memory-backed fallback queue.
    pub fallback_max_pending: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Hard ceiling on live execution units across all tenants.
    pub global_ceiling: u32,
    pub dequeue_timeout_ms: u64,
    pub idle_backoff_ms: u64,
    /// Bound on the worker-event channel feeding the metrics collector.
    pub event_buffer_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    pub evaluation_interval_seconds: u64,
    /// One of "cost", "balanced", "performance".
    pub strategy: String,
    pub target_throughput_per_hour: u32,
    pub target_latency_seconds: u64,
    /// Expected service rate per worker, used to convert demand to workers.
    pub tasks_per_worker_hour: u32,
    /// Damping: largest per-tenant allocation change per cycle.
    pub max_step_per_cycle: u32,
    /// Queue depth that triggers scale-up consideration.
    pub queue_high_water: usize,
    /// Throughput (tasks/hour) below which an idle tenant may shrink.
    pub throughput_low_water: f64,
    /// Queue depth at or below which a tenant counts as drained.
    pub scale_down_depth_threshold: usize,
    /// Task kind whose results feed the compliance pass rate.
    pub compliance_kind: String,
    /// Snapshots and change records kept in memory for the API.
    pub history_limit: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub cors_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
    pub metrics_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskKindConfig {
    pub kind: String,
    /// HTTP endpoint the handler posts the task payload to.
    pub endpoint: String,
    pub default_priority: String,
    pub timeout_seconds: u64,
    pub max_attempts: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker: WorkerPoolConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            api: ApiConfig::default(),
            observability: ObservabilityConfig::default(),
            channels_dir: "config/channels".to_string(),
            task_kinds: Vec::new(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            broker_url: None,
            namespace: "omniq".to_string(),
            connect_timeout_seconds: 5,
            poll_interval_ms: 200,
            retry_backoff_base_ms: 1_000,
            retry_backoff_cap_ms: 300_000,
            retention_seconds: 3_600,
            max_payload_bytes: 256 * 1024,
            // sized for a small managed broker tier (10MB free plans)
            max_total_bytes: 8 * 1024 * 1024,
            fallback_max_pending: 10_000,
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            global_ceiling: 32,
            dequeue_timeout_ms: 1_000,
            idle_backoff_ms: 500,
            event_buffer_size: 1_024,
        }
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_seconds: 30,
            strategy: "balanced".to_string(),
            target_throughput_per_hour: 100,
            target_latency_seconds: 600,
            tasks_per_worker_hour: 20,
            max_step_per_cycle: 1,
            queue_high_water: 50,
            throughput_low_water: 10.0,
            scale_down_depth_threshold: 1,
            compliance_kind: "compliance_check".to_string(),
            history_limit: 256,
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0:8080".to_string(),
            cors_enabled: true,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
        }
    }
}
