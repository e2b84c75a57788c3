//! Queue backends: a Redis broker implementation, the in-process fallback
//! and the startup factory that picks between them. Both backends enforce
//! the same admission, quota, fairness and retry rules.

pub mod backoff;
pub mod broker;
pub mod fallback;
pub mod factory;
pub mod quota;

pub use backoff::BackoffPolicy;
pub use broker::RedisBrokerQueue;
pub use fallback::FallbackQueue;
pub use factory::QueueFactory;
pub use quota::QuotaTracker;
