//! Worker pool and execution units. Units are bound to a tenant and a
//! priority class, drain the lanes that class allows, enforce per-attempt
//! deadlines and report every outcome to the metrics collector.

mod execution;

pub mod events;
pub mod handlers;
pub mod pool;

pub use events::EventSink;
pub use handlers::HttpCallHandler;
pub use pool::WorkerPool;
