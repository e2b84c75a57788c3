//! Read-only HTTP surface: health, metrics snapshots, allocations, scaling
//! history, task lookup and the Prometheus exposition endpoint.

pub mod handlers;
pub mod response;
pub mod routes;
pub mod server;

pub use routes::{create_routes, AppState};
pub use server::serve;
