//! service-core: Shared infrastructure for the access platform services.
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod rate_limit;

pub use async_trait;
pub use axum;
pub use redis;
pub use serde;
pub use serde_json;
pub use tokio;
pub use tower;
pub use tower_http;
pub use tracing;
pub use validator;
