mod channels;
mod loader;
mod models;

pub use channels::{ChannelConfig, ChannelConfigStore, PRIORITY_CLASSES};
pub use models::{
    ApiConfig, AppConfig, ObservabilityConfig, OrchestratorConfig, QueueConfig, TaskKindConfig,
    WorkerPoolConfig,
};
